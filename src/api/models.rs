//! Admin API payloads.

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Orders per page used by the admin API.
pub const ORDERS_PER_PAGE: u64 = 10;

/// Accept `"7"` or `7`.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

/// Accept `"12.50"`, `12.5` or null (as 0).
fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0)),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid number '{}'", s))),
        Value::Null => Ok(0.0),
        other => Err(serde::de::Error::custom(format!("expected number, got {}", other))),
    }
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = lenient_f64(deserializer)?;
    if value < 0.0 {
        return Err(serde::de::Error::custom("negative quantity"));
    }
    Ok(value as u64)
}

/// Roster entry from `GET /fridge/admin/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fridge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(deserialize_with = "string_or_number")]
    pub account: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Fridge {
    /// Realtime store namespace for this fridge.
    pub fn device_id(&self) -> &str {
        &self.account
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub price: f64,
    #[serde(default)]
    pub image: Option<String>,
}

/// Partial product update for `PATCH /product/admin/{id}/`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProductUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Stock line of one product in one fridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FridgeProduct {
    /// `None` for a line not yet stored by the API.
    #[serde(default)]
    pub id: Option<i64>,
    pub product: Product,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub quantity: u64,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// `GET /fridge/admin/{id}/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FridgeDetail {
    #[serde(flatten)]
    pub fridge: Fridge,
    #[serde(default)]
    pub fridge_products: Vec<FridgeProduct>,
}

/// Partial fridge update for `PATCH /fridge/admin/{id}/`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FridgeUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderProduct {
    pub product: Product,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub total_sum: f64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub total_quantity: u64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub order_products: Vec<OrderProduct>,
}

impl Order {
    pub fn parsed_date(&self) -> Option<DateTime<FixedOffset>> {
        self.date
            .as_deref()
            .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
    }
}

/// Paginated `GET /order/admin/?page=&status=`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPage {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
    #[serde(default)]
    pub results: Vec<Order>,
}

impl OrderPage {
    pub fn total_pages(&self) -> u64 {
        self.count.div_ceil(ORDERS_PER_PAGE)
    }

    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }
}

/// Revenue and units sold over a set of orders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OrderTotals {
    pub total_sum: f64,
    pub total_quantity: u64,
}

impl OrderTotals {
    pub fn from_orders<'a>(orders: impl IntoIterator<Item = &'a Order>) -> Self {
        orders.into_iter().fold(Self::default(), |acc, order| Self {
            total_sum: acc.total_sum + order.total_sum,
            total_quantity: acc.total_quantity + order.total_quantity,
        })
    }
}

/// Orders placed within the last `days` days of `now`. Undated orders are dropped.
pub fn filter_orders_since(orders: &[Order], days: i64, now: DateTime<Utc>) -> Vec<Order> {
    let threshold = now - Duration::days(days);
    orders
        .iter()
        .filter(|order| order.parsed_date().is_some_and(|d| d >= threshold))
        .cloned()
        .collect()
}

/// Stock lines for a new assortment of `(product id, quantity)` pairs.
///
/// Products already stocked keep their line id; new ones get a line without
/// one. Fails with the first product id missing from `catalog`.
pub fn build_assortment(
    current: &[FridgeProduct],
    catalog: &[Product],
    wanted: &[(i64, u64)],
) -> Result<Vec<FridgeProduct>, i64> {
    wanted
        .iter()
        .map(|&(product_id, quantity)| {
            if let Some(line) = current.iter().find(|l| l.product.id == Some(product_id)) {
                return Ok(FridgeProduct {
                    quantity,
                    ..line.clone()
                });
            }
            let product = catalog
                .iter()
                .find(|p| p.id == Some(product_id))
                .ok_or(product_id)?;
            Ok(FridgeProduct {
                id: None,
                product: product.clone(),
                quantity,
                updated_at: None,
            })
        })
        .collect()
}

/// `POST /auth/sign-in` and `/auth/sign-in/refresh` responses.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenPair {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpRequest {
    pub email: String,
    pub company_name: String,
    pub password: String,
    pub password2: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpResponse {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub company_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyEmailRequest {
    pub email: String,
    pub verification_code: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fridge_account_string_or_number() {
        let fridges: Vec<Fridge> = serde_json::from_value(json!([
            {"account": "7", "address": "A"},
            {"account": 3, "address": "B", "owner": "Dana"},
        ]))
        .unwrap();
        assert_eq!(fridges[0].device_id(), "7");
        assert_eq!(fridges[1].account, "3");
        assert_eq!(fridges[1].owner.as_deref(), Some("Dana"));
        assert!(fridges[0].owner.is_none());
    }

    #[test]
    fn test_fridge_detail_with_products() {
        let detail: FridgeDetail = serde_json::from_value(json!({
            "id": 1,
            "account": "42",
            "address": "Main St 1",
            "description": "lobby",
            "fridge_products": [
                {"id": 5, "quantity": "3", "product": {"name": "Water", "price": "1.50"}}
            ]
        }))
        .unwrap();
        assert_eq!(detail.fridge.account, "42");
        assert_eq!(detail.fridge_products[0].quantity, 3);
        assert_eq!(detail.fridge_products[0].product.price, 1.5);
    }

    #[test]
    fn test_build_assortment_keeps_existing_lines() {
        let current: Vec<FridgeProduct> = serde_json::from_value(json!([
            {"id": 5, "quantity": 3, "product": {"id": 1, "name": "Water", "price": 1.5}},
            {"id": 6, "quantity": 1, "product": {"id": 2, "name": "Cola", "price": 2}},
        ]))
        .unwrap();
        let catalog: Vec<Product> = serde_json::from_value(json!([
            {"id": 1, "name": "Water", "price": 1.5},
            {"id": 2, "name": "Cola", "price": 2},
            {"id": 3, "name": "Juice", "price": 3},
        ]))
        .unwrap();

        let lines = build_assortment(&current, &catalog, &[(1, 8), (3, 2)]).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!((lines[0].id, lines[0].quantity), (Some(5), 8));
        assert_eq!((lines[1].id, lines[1].quantity), (None, 2));
        assert_eq!(lines[1].product.name, "Juice");

        assert_eq!(build_assortment(&current, &catalog, &[(9, 1)]), Err(9));
    }

    #[test]
    fn test_order_totals_and_pages() {
        let page: OrderPage = serde_json::from_value(json!({
            "count": 21,
            "next": "https://host/api/order/admin/?page=2",
            "results": [
                {"id": 1, "total_sum": "10.50", "total_quantity": 2},
                {"id": 2, "total_sum": 4, "total_quantity": "1"},
            ]
        }))
        .unwrap();
        assert_eq!(page.total_pages(), 3);
        assert!(page.has_next());

        let totals = OrderTotals::from_orders(&page.results);
        assert_eq!(totals.total_sum, 14.5);
        assert_eq!(totals.total_quantity, 3);
    }

    #[test]
    fn test_filter_orders_since() {
        let now = DateTime::parse_from_rfc3339("2024-05-10T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let orders: Vec<Order> = serde_json::from_value(json!([
            {"id": 1, "date": "2024-05-09T08:00:00+00:00"},
            {"id": 2, "date": "2024-04-01T08:00:00+00:00"},
            {"id": 3},
        ]))
        .unwrap();

        let recent = filter_orders_since(&orders, 7, now);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, 1);
    }

    #[test]
    fn test_sign_up_uses_camel_case() {
        let body = serde_json::to_value(SignUpRequest {
            email: "ops@example.com".into(),
            company_name: "Cold Co".into(),
            password: "pw".into(),
            password2: "pw".into(),
        })
        .unwrap();
        assert_eq!(body["companyName"], "Cold Co");
    }
}
