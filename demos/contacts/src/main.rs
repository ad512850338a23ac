//! Master/detail walkthrough: a customers window whose orders source
//! depends on the customer selection, plus an awaited dialog commit that
//! hands a value back into the caller's form.
//!
//! Run with `cargo run -p contacts-demo`. Everything is driven against a
//! canned in-memory connector, so the output is deterministic.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use metaframe::prelude::*;
use metaframe::{StaticConnector, dispatch_command};
use serde_json::{Value, json};
use tracing::info;

fn metadata() -> WindowMetadata {
    serde_json::from_value(json!({
        "namespace": "crm",
        "windowTitle": "Customers",
        "defaultDataSource": "customers",
        "actions": [],
        "dataSources": [{
            "id": "customers",
            "selectionMode": "single",
            "uniqueKey": [{"field": "id"}],
            "selectors": {"data": "rows", "dataInfo": "info"}
        }, {
            "id": "orders",
            "selectionMode": "multi",
            "uniqueKey": [{"field": "id"}],
            "selectors": {"data": "rows"},
            "parameters": [
                {"name": "customerId", "location": "customers.id", "in": "dataSource"}
            ]
        }],
        "dialogs": [{"id": "pickEmail", "dataSourceRef": "customers"}]
    }))
    .expect("demo metadata is well-formed")
}

fn connectors() -> HashMap<String, Arc<dyn Connector>> {
    let mut table: HashMap<String, Arc<dyn Connector>> = HashMap::new();
    table.insert(
        "customers".into(),
        Arc::new(StaticConnector::with_payload(json!({
            "rows": [
                {"id": 1, "name": "Ada Lovelace", "email": "ada@example.com"},
                {"id": 2, "name": "Grace Hopper", "email": "grace@example.com"}
            ],
            "info": {"pageCount": 1, "totalCount": 2}
        }))),
    );
    table.insert(
        "orders".into(),
        Arc::new(StaticConnector::with_responder(|query| {
            let customer = query
                .parameters
                .get("customerId")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            Ok(json!({
                "rows": [
                    {"id": customer * 100 + 1, "item": "keyboard"},
                    {"id": customer * 100 + 2, "item": "terminal"}
                ]
            }))
        })),
    );
    table
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), EngineError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,metaframe_core=debug")),
        )
        .init();

    let mut engine = Engine::new();
    let table = connectors();
    engine.set_connector_factory(Rc::new(move |descriptor| {
        table
            .get(&descriptor.id)
            .cloned()
            .unwrap_or_else(|| Arc::new(metaframe::NullConnector))
    }));

    let window_id = engine.open_window(
        metadata(),
        WindowSpec {
            key: "customers".into(),
            title: "Customers".into(),
            ..WindowSpec::default()
        },
    )?;
    engine.run_until_idle().await;

    let customers = engine.window_context(&window_id)?.context("customers")?;
    info!(count = customers.collection().len(), "customers loaded");

    // Selecting a customer fans its id out into the orders source, which
    // then fetches on its own.
    engine
        .controller(&window_id, "customers")?
        .set_selection(Some(1));
    engine.run_until_idle().await;

    let orders = engine.window_context(&window_id)?.context("orders")?;
    info!(
        customer = %customers.form()["name"],
        orders = orders.collection().len(),
        "orders follow the selection"
    );
    for order in orders.collection() {
        info!(order = %order, "order");
    }

    // Awaited dialog: commit hands the email back into the caller's form.
    let parameters: Vec<HandoffParameter> = serde_json::from_value(json!([
        {"name": "email", "direction": "out", "to": "customers:form"}
    ]))
    .expect("demo parameters are well-formed");
    let pending = engine
        .open_dialog(
            &window_id,
            "pickEmail",
            json!({"hint": "pick a contact email"}),
            OpenOptions {
                await_result: true,
                parameters,
                ..OpenOptions::default()
            },
        )?
        .expect("await_result was requested");

    // The bridge commits with no payload: the dialog falls back to its
    // backing source's current selection.
    dispatch_command(
        &mut engine,
        "ui.dialog.commit",
        &json!({"windowId": window_id, "dialogId": "pickEmail"}),
    )?;
    let committed = pending.wait().await.unwrap_or_default();
    info!(email = %committed["email"], "dialog committed");
    info!(form_email = %customers.form()["email"], "caller form updated");

    engine.close_window(&window_id);
    Ok(())
}
