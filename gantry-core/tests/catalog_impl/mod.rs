// A small in-memory catalog served through the dispatcher.
#![allow(dead_code)]

use catalog_service::catalog_service;
use gantry_core::{
    client::Client,
    config::Config,
    error::{Failure, StatusKind},
    handler::Handler,
    request::{Reply, Request},
    server::{Controller, Dispatcher},
};
use serde_json::{Value, json};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

pub fn product(sku: &str, stock: i64) -> Value {
    json!({
        "sku": sku,
        "name": format!("Product {sku}"),
        "category": "tools",
        "stock": stock,
    })
}

/// Serves `GetProduct`, counting the calls it receives.
#[derive(Default)]
pub struct GetProduct {
    pub calls: Arc<AtomicUsize>,
    pub latency: Duration,
}

#[tonic::async_trait]
impl Handler for GetProduct {
    async fn handle(&self, request: &mut Request) -> Result<Reply, Failure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let sku = request
            .message()
            .and_then(|m| m["sku"].as_str())
            .unwrap_or_default()
            .to_string();

        match sku.as_str() {
            "" => {
                request
                    .error_mut()
                    .add_field_error("sku", "blank", "SKU can't be blank");
                Err(request.fail(
                    StatusKind::InvalidArgument,
                    Some("invalid_request"),
                    "Request is invalid",
                ))
            }
            "missing" => Err(request.fail_with_metadata(
                StatusKind::NotFound,
                Some("product_not_found"),
                "No such product",
                [("product-sku", sku.as_str())],
            )),
            "bulky" => {
                for i in 0..500 {
                    request
                        .error_mut()
                        .add_field_error(format!("line_{i}"), "invalid", "Line is invalid");
                }
                Err(request.fail(StatusKind::InvalidArgument, None, "Too many invalid lines"))
            }
            "boom" => Err(Failure::unexpected("warehouse offline")),
            "panic" => panic!("stock ledger corrupted"),
            _ => Ok(Reply::Message(product(&sku, 3))),
        }
    }
}

/// Serves `ImportProducts`: counts and lists the streamed products.
pub struct ImportProducts;

#[tonic::async_trait]
impl Handler for ImportProducts {
    async fn handle(&self, request: &mut Request) -> Result<Reply, Failure> {
        let mut skus = Vec::new();
        while let Some(product) = request.next_message().await? {
            skus.push(product["sku"].as_str().unwrap_or_default().to_string());
        }

        Ok(Reply::Message(json!({
            "imported": skus.len(),
            "skus": skus,
        })))
    }
}

/// Serves `ListProducts`: emits `limit` products of the category.
pub struct ListProducts;

#[tonic::async_trait]
impl Handler for ListProducts {
    async fn handle(&self, request: &mut Request) -> Result<Reply, Failure> {
        let params = request.message().cloned().unwrap_or_default();
        let category = params["category"].as_str().unwrap_or("tools").to_string();
        let limit = params["limit"].as_i64().unwrap_or(0);

        for i in 0..limit {
            let mut item = product(&format!("{category}-{i}"), i);
            item["category"] = json!(category);
            request.emit(item).await?;
        }

        if category == "discontinued" {
            return Err(request.fail(
                StatusKind::FailedPrecondition,
                Some("category_discontinued"),
                "Category is discontinued",
            ));
        }

        Ok(Reply::Streamed)
    }
}

/// Serves `SyncProducts`: echoes every product back with one more unit in stock.
pub struct SyncProducts;

#[tonic::async_trait]
impl Handler for SyncProducts {
    async fn handle(&self, request: &mut Request) -> Result<Reply, Failure> {
        while let Some(mut product) = request.next_message().await? {
            let stock = product["stock"].as_i64().unwrap_or(0);
            product["stock"] = json!(stock + 1);
            request.emit(product).await?;
        }
        Ok(Reply::Streamed)
    }
}

pub fn controller(get_product: GetProduct) -> Controller {
    Controller::new()
        .handle("get_product", get_product)
        .handle("import_products", ImportProducts)
        .handle("list_products", ListProducts)
        .handle("sync_products", SyncProducts)
}

/// A dispatcher with the whole catalog bound.
pub fn dispatcher(config: Config) -> Dispatcher {
    dispatcher_with(config, GetProduct::default())
}

pub fn dispatcher_with(config: Config, get_product: GetProduct) -> Dispatcher {
    let dispatcher = Dispatcher::new(config);
    dispatcher
        .bind(&catalog_service(), &controller(get_product))
        .unwrap();
    dispatcher
}

/// A client calling `dispatcher` in memory.
pub fn client(dispatcher: &Dispatcher) -> Client<Dispatcher> {
    Client::new(
        dispatcher.clone(),
        catalog_service(),
        Arc::clone(dispatcher.config()),
    )
}
