//! Admin endpoints: fridges, products and orders.

use super::client::ApiClient;
use super::models::{
    Fridge, FridgeDetail, FridgeProduct, FridgeUpdate, Order, OrderPage, Product, ProductUpdate,
};
use crate::error::Result;
use crate::fridge::RosterSource;
use async_trait::async_trait;
use log::debug;
use reqwest::Method;
use serde_json::json;

impl ApiClient {
    /// `GET /fridge/admin/`
    pub async fn list_fridges(&self) -> Result<Vec<Fridge>> {
        let fridges: Vec<Fridge> = self.get_json("fridge/admin/").await?;
        debug!("Fetched {} fridges", fridges.len());
        Ok(fridges)
    }

    /// `GET /fridge/admin/{account}/` with stocked products.
    pub async fn get_fridge(&self, account: &str) -> Result<FridgeDetail> {
        self.get_json(&format!("fridge/admin/{}/", account)).await
    }

    pub async fn update_fridge(&self, account: &str, update: &FridgeUpdate) -> Result<Fridge> {
        self.send_json(Method::PATCH, &format!("fridge/admin/{}/", account), update)
            .await
    }

    /// Set the stocked quantity of one fridge product line.
    pub async fn update_fridge_product_quantity(&self, line_id: i64, quantity: u64) -> Result<()> {
        let body = json!({ "quantity": quantity });
        self.send_authorized(
            Method::PATCH,
            &format!("fridgeproduct/admin/{}/", line_id),
            Some(&body),
        )
        .await?;
        debug!("Fridge product line {} set to {}", line_id, quantity);
        Ok(())
    }

    /// Replace a fridge's whole assortment.
    pub async fn set_fridge_products(&self, account: &str, lines: &[FridgeProduct]) -> Result<()> {
        let body = json!({ "fridge_products": lines });
        self.send_authorized(Method::PUT, &format!("fridge/admin/{}/", account), Some(&body))
            .await?;
        debug!("Fridge {} assortment set to {} lines", account, lines.len());
        Ok(())
    }

    pub async fn list_products(&self) -> Result<Vec<Product>> {
        self.get_json("product/admin/").await
    }

    pub async fn get_product(&self, id: i64) -> Result<Product> {
        self.get_json(&format!("product/admin/{}/", id)).await
    }

    pub async fn create_product(&self, product: &Product) -> Result<Product> {
        self.send_json(Method::POST, "product/admin/", product).await
    }

    pub async fn update_product(&self, id: i64, update: &ProductUpdate) -> Result<Product> {
        self.send_json(Method::PATCH, &format!("product/admin/{}/", id), update)
            .await
    }

    pub async fn delete_product(&self, id: i64) -> Result<()> {
        self.delete(&format!("product/admin/{}/", id)).await
    }

    /// One page of orders, optionally filtered by status (e.g. `SUCCESS`).
    pub async fn list_orders(&self, page: u64, status: Option<&str>) -> Result<OrderPage> {
        let mut path = format!("order/admin/?page={}", page.max(1));
        if let Some(status) = status {
            path.push_str("&status=");
            path.push_str(status);
        }
        self.get_json(&path).await
    }

    /// `GET /order/admin/{id}` with its product lines.
    pub async fn get_order(&self, id: i64) -> Result<Order> {
        self.get_json(&format!("order/admin/{}/", id)).await
    }

    /// Walk every page until the API reports no `next`.
    pub async fn fetch_all_orders(&self, status: Option<&str>) -> Result<Vec<Order>> {
        let mut orders = Vec::new();
        let mut page = 1;
        loop {
            let current = self.list_orders(page, status).await?;
            let done = !current.has_next() || current.results.is_empty();
            orders.extend(current.results);
            if done {
                break;
            }
            page += 1;
        }
        debug!("Fetched {} orders over {} pages", orders.len(), page);
        Ok(orders)
    }
}

#[async_trait]
impl RosterSource for ApiClient {
    async fn fetch_roster(&self) -> Result<Vec<Fridge>> {
        self.list_fridges().await
    }
}
