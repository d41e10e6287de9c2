//! Operator CLI for the fridge fleet.
//!
//! Usage:
//!   fridge-monitor login <username>
//!   fridge-monitor list --sort availability
//!   fridge-monitor watch
//!   fridge-monitor door toggle <account>
//!   fridge-monitor orders --page 2
//!   fridge-monitor assortment <account> 1=10 4=6

use chrono::Utc;
use clap::{Parser, Subcommand};
use fridge_monitor::api::ApiClient;
use fridge_monitor::api::models::{OrderTotals, build_assortment, filter_orders_since};
use fridge_monitor::config::{self, Config};
use fridge_monitor::error::{DashboardError, Result};
use fridge_monitor::fridge::{
    DoorActuator, DoorCommand, DoorState, FridgeCollection, FridgeRow, LivenessSettings, SortKey,
};
use fridge_monitor::session::SessionStore;
use fridge_monitor::telemetry::{self, TelemetryPath};
use log::{error, info, warn};
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[derive(Parser)]
#[command(name = "fridge-monitor")]
#[command(about = "Monitor fridge liveness and control fridge doors")]
struct Cli {
    /// Admin API base URL
    #[arg(long, env = "API_BASE_URL")]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and store the session
    Login {
        username: String,
        /// Read from stdin when omitted
        #[arg(long, env = "FRIDGE_MONITOR_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Forget the stored session
    Logout,
    /// Show the signed-in operator
    Whoami,
    /// Print the roster with liveness once
    List {
        #[arg(long, default_value_t = SortKey::Number)]
        sort: SortKey,
        /// How long to collect heartbeats before printing
        #[arg(long, default_value_t = 3)]
        settle_secs: u64,
    },
    /// Follow fridge liveness until Ctrl+C
    Watch {
        #[arg(long, default_value_t = SortKey::Number)]
        sort: SortKey,
    },
    /// Show one fridge with its stock
    Show { account: String },
    /// Send a door command to a fridge
    Door { command: DoorCommand, account: String },
    /// Set the quantity of one stock line (line ids are shown by `show`)
    Stock { line_id: i64, quantity: u64 },
    /// Replace a fridge's assortment with PRODUCT_ID=QUANTITY pairs
    Assortment {
        account: String,
        #[arg(required = true, value_parser = parse_stock_pair)]
        items: Vec<(i64, u64)>,
    },
    /// List products
    Products,
    /// Show one order with its products
    Order { id: i64 },
    /// Show a page of orders with totals
    Orders {
        #[arg(long, default_value_t = 1)]
        page: u64,
        #[arg(long, default_value = "SUCCESS")]
        status: String,
        /// Only orders from the last N days (fetches every page)
        #[arg(long)]
        days: Option<i64>,
    },
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    config::load_dotenv();
    init_logger();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(url) = cli.api_url.clone() {
        config.api.base_url = url;
    }

    if let Err(e) = run(cli.command, config).await {
        match e {
            DashboardError::LoginRequired => error!("{} (run `fridge-monitor login`)", e),
            e => error!("{}", e),
        }
        std::process::exit(1);
    }
}

async fn run(command: Commands, config: Config) -> Result<()> {
    let session = Arc::new(SessionStore::open(config.session.path.clone()));
    let api = Arc::new(ApiClient::new(&config.api, session.clone())?);

    match command {
        Commands::Login { username, password } => {
            let password = match password {
                Some(password) => password,
                None => read_password()?,
            };
            api.sign_in(&username, &password).await?;
            println!("Signed in as {}", username);
        }
        Commands::Logout => {
            session.clear();
            println!("Signed out");
        }
        Commands::Whoami => {
            let current = session.get();
            match current.username {
                Some(name) if session.is_logged_in() => println!("{}", name),
                _ => println!("Not signed in"),
            }
            if let Some(company) = current.company {
                println!("Company: {}", company);
            }
        }
        Commands::List { sort, settle_secs } => {
            let mut fridges = collection(&config, api)?;
            fridges.refresh().await?;
            tokio::time::sleep(Duration::from_secs(settle_secs)).await;
            print_rows(&fridges.view(sort));
            fridges.shutdown();
        }
        Commands::Watch { sort } => watch(&config, api, sort).await?,
        Commands::Show { account } => {
            let detail = api.get_fridge(&account).await?;
            println!(
                "Fridge {} at {}",
                detail.fridge.account, detail.fridge.address
            );
            if let Some(description) = &detail.fridge.description {
                println!("  {}", description);
            }
            for line in &detail.fridge_products {
                println!(
                    "  {:>5} {:<30} x{:<4} {:>8.2}",
                    line.id.map(|id| id.to_string()).unwrap_or_default(),
                    line.product.name,
                    line.quantity,
                    line.product.price
                );
            }
        }
        Commands::Door { command, account } => {
            let store = telemetry::connect(&config)?;
            let current = DoorState::from_value(
                &store.read(&TelemetryPath::door(&account)).await?,
            )
            .unwrap_or_default();
            DoorActuator::new(account.clone(), store)
                .execute(command, current)
                .await?;
            println!("Sent {} to fridge {}", command, account);
        }
        Commands::Stock { line_id, quantity } => {
            api.update_fridge_product_quantity(line_id, quantity).await?;
            println!("Stock line {} set to {}", line_id, quantity);
        }
        Commands::Assortment { account, items } => {
            let detail = api.get_fridge(&account).await?;
            let catalog = api.list_products().await?;
            let lines = build_assortment(&detail.fridge_products, &catalog, &items)
                .map_err(DashboardError::UnknownProduct)?;
            api.set_fridge_products(&account, &lines).await?;
            println!("Fridge {} now stocks {} products", account, lines.len());
        }
        Commands::Products => {
            for product in api.list_products().await? {
                println!(
                    "{:>5} {:<30} {:>8.2}",
                    product.id.map(|id| id.to_string()).unwrap_or_default(),
                    product.name,
                    product.price
                );
            }
        }
        Commands::Order { id } => {
            let order = api.get_order(id).await?;
            println!(
                "Order #{} {} ({})",
                order.id,
                order.date.as_deref().unwrap_or("-"),
                order.status.as_deref().unwrap_or("-")
            );
            for line in &order.order_products {
                println!(
                    "  {:<30} x{:<4} {:>8.2}",
                    line.product.name, line.amount, line.product.price
                );
            }
            println!("Total: {} pcs, {:.2}", order.total_quantity, order.total_sum);
        }
        Commands::Orders { page, status, days } => {
            let orders = match days {
                Some(days) => {
                    let all = api.fetch_all_orders(Some(&status)).await?;
                    filter_orders_since(&all, days, Utc::now())
                }
                None => {
                    let current = api.list_orders(page, Some(&status)).await?;
                    println!("Page {} of {}", page, current.total_pages());
                    current.results
                }
            };
            for order in &orders {
                println!(
                    "#{:<6} {:<25} {:>4} pcs {:>10.2}",
                    order.id,
                    order.date.as_deref().unwrap_or("-"),
                    order.total_quantity,
                    order.total_sum
                );
            }
            let totals = OrderTotals::from_orders(&orders);
            println!(
                "Total: {} pcs, {:.2}",
                totals.total_quantity, totals.total_sum
            );
        }
    }
    Ok(())
}

fn parse_stock_pair(arg: &str) -> std::result::Result<(i64, u64), String> {
    let (product, quantity) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected PRODUCT_ID=QUANTITY, got '{}'", arg))?;
    let product = product
        .trim()
        .parse()
        .map_err(|_| format!("invalid product id '{}'", product))?;
    let quantity = quantity
        .trim()
        .parse()
        .map_err(|_| format!("invalid quantity '{}'", quantity))?;
    Ok((product, quantity))
}

fn read_password() -> Result<String> {
    eprint!("Password: ");
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn collection(config: &Config, api: Arc<ApiClient>) -> Result<FridgeCollection> {
    let store = telemetry::connect(config)?;
    Ok(FridgeCollection::new(
        api,
        store,
        LivenessSettings {
            poll_interval: config.liveness.poll_interval(),
        },
    ))
}

async fn watch(config: &Config, api: Arc<ApiClient>, sort: SortKey) -> Result<()> {
    let mut fridges = collection(config, api)?;
    fridges.refresh().await?;

    info!("Watching {} fridges, press Ctrl+C to exit", fridges.roster().len());

    let mut roster_tick = tokio::time::interval(config.liveness.roster_refresh());
    roster_tick.tick().await;
    let mut render_tick = tokio::time::interval(Duration::from_secs(1));
    let mut last_render = Vec::new();

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received shutdown signal"),
                    Err(e) => error!("Failed to listen for shutdown signal: {}", e),
                }
                break;
            }
            _ = roster_tick.tick() => {
                // Errors keep the previous roster; retry on the next tick
                if let Err(e) = fridges.refresh().await {
                    warn!("Roster refresh failed: {}", e);
                }
            }
            _ = render_tick.tick() => {
                let rows = fridges.view(sort);
                if rows != last_render {
                    print_rows(&rows);
                    last_render = rows;
                }
            }
        }
    }

    fridges.shutdown();
    Ok(())
}

fn print_rows(rows: &[FridgeRow]) {
    println!(
        "{:<8} {:<14} {:<7} {:<12} {:<20} ADDRESS",
        "FRIDGE", "STATUS", "DOOR", "HEARTBEAT", "OWNER"
    );
    for row in rows {
        let (status, door, heartbeat) = match &row.snapshot {
            Some(s) => (
                s.phase.to_string(),
                if s.door_controls_visible() {
                    s.door.to_string()
                } else {
                    "-".to_string()
                },
                s.last_heartbeat
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "-".to_string()),
            ),
            None => ("not mounted".to_string(), "-".to_string(), "-".to_string()),
        };
        println!(
            "{:<8} {:<14} {:<7} {:<12} {:<20} {}",
            row.fridge.account,
            status,
            door,
            heartbeat,
            row.fridge.owner.as_deref().unwrap_or("-"),
            row.fridge.address
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stock_pair() {
        assert_eq!(parse_stock_pair("4=12"), Ok((4, 12)));
        assert_eq!(parse_stock_pair(" 4 = 0 "), Ok((4, 0)));
        assert!(parse_stock_pair("4").is_err());
        assert!(parse_stock_pair("x=1").is_err());
        assert!(parse_stock_pair("4=-1").is_err());
    }

    #[test]
    fn test_assortment_arguments() {
        let cli =
            Cli::try_parse_from(["fridge-monitor", "assortment", "12", "1=10", "4=6"]).unwrap();
        match cli.command {
            Commands::Assortment { account, items } => {
                assert_eq!(account, "12");
                assert_eq!(items, vec![(1, 10), (4, 6)]);
            }
            _ => panic!("expected assortment"),
        }
        assert!(Cli::try_parse_from(["fridge-monitor", "assortment", "12"]).is_err());
    }
}
