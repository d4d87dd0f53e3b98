//! View State Integration Tests
//!
//! End-to-end scenarios through `ViewStateAdapter`: bind, live updates,
//! release, degraded status during reconnect, and terminal failure.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::time::Duration;

use futures_util::StreamExt;
use rust_decimal::Decimal;

use common::{ConnectStep, ScriptedTransport, eventually, fast_config, stream_over};
use market_stream_bridge::application::services::reconnect::ReconnectConfig;
use market_stream_bridge::{
    ConnectionConfig, ConnectionStatus, MarketPayload, TransportError, ViewStateAdapter, ViewStatus,
};

fn adapter(transport: &ScriptedTransport) -> ViewStateAdapter {
    ViewStateAdapter::new(stream_over(transport, fast_config()))
}

// =============================================================================
// Live Updates
// =============================================================================

#[tokio::test]
async fn tick_updates_value_and_status() {
    let transport = ScriptedTransport::new();
    let adapter = adapter(&transport);

    let view = adapter.bind("AAPL.tick");
    assert_eq!(view.snapshot().status, ViewStatus::Loading);

    eventually("connected", || adapter.status() == ConnectionStatus::Connected).await;
    assert_eq!(view.snapshot().status, ViewStatus::Loading);

    transport.push_text(r#"{"topic":"AAPL.tick","price":150.2}"#);
    eventually("value", || view.snapshot().has_value()).await;

    let state = view.snapshot();
    assert_eq!(state.status, ViewStatus::Connected);
    assert_eq!(state.last_price, Some(Decimal::new(1502, 1)));
    assert!(matches!(state.value, Some(MarketPayload::Tick(_))));
    assert!(state.updated_at.is_some());
    assert_eq!(state.update_count, 1);
    assert!(state.error.is_none());
}

#[tokio::test]
async fn changes_stream_yields_each_update() {
    let transport = ScriptedTransport::new();
    let adapter = adapter(&transport);
    let view = adapter.bind("AAPL.tick");
    eventually("connected", || adapter.status() == ConnectionStatus::Connected).await;

    let mut changes = view.changes();
    let initial = changes.next().await.unwrap();
    assert!(!initial.has_value());

    transport.push_text(r#"{"topic":"AAPL.tick","price":"150.25"}"#);
    let next = tokio::time::timeout(Duration::from_secs(2), changes.next())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(next.last_price, Some(Decimal::new(15025, 2)));
}

#[tokio::test]
async fn book_and_status_payloads_keep_last_price() {
    let transport = ScriptedTransport::new();
    let adapter = adapter(&transport);
    let view = adapter.bind("AAPL.book");
    eventually("connected", || adapter.status() == ConnectionStatus::Connected).await;

    transport.push_text(concat!(
        r#"{"topic":"AAPL.book","type":"book","#,
        r#""bids":[{"price":99,"size":1}],"asks":[{"price":101,"size":2}]}"#,
    ));
    eventually("book", || view.snapshot().update_count == 1).await;
    assert_eq!(view.snapshot().last_price, Some(Decimal::new(100, 0)));

    transport.push_text(r#"{"topic":"AAPL.book","type":"status","status":"halted"}"#);
    eventually("status", || view.snapshot().update_count == 2).await;

    let state = view.snapshot();
    assert!(matches!(state.value, Some(MarketPayload::Status(_))));
    assert_eq!(state.last_price, Some(Decimal::new(100, 0)));
}

#[tokio::test]
async fn unpriceable_book_does_not_stall_other_topics() {
    let transport = ScriptedTransport::new();
    let adapter = adapter(&transport);
    let book = adapter.bind("AAPL.book");
    let tick = adapter.bind("MSFT.tick");
    eventually("joins", || transport.sent_topics("subscribe").len() == 2).await;

    let level = format!(r#"[{{"price":"{}","size":1}}]"#, Decimal::MAX);
    transport.push_text(&format!(
        r#"{{"topic":"AAPL.book","type":"book","bids":{level},"asks":{level}}}"#
    ));
    transport.push_text(r#"{"topic":"MSFT.tick","price":410}"#);
    eventually("tick after book", || tick.snapshot().has_value()).await;

    assert_eq!(tick.snapshot().last_price, Some(Decimal::new(410, 0)));
    assert_eq!(book.snapshot().update_count, 1);
    assert_eq!(book.snapshot().last_price, None);
    assert_eq!(adapter.status(), ConnectionStatus::Connected);

    transport.push_text(r#"{"topic":"MSFT.tick","price":411}"#);
    eventually("later tick", || tick.snapshot().update_count == 2).await;
}

// =============================================================================
// Release
// =============================================================================

#[tokio::test]
async fn late_message_after_release_is_ignored() {
    let transport = ScriptedTransport::new();
    let adapter = adapter(&transport);

    let keep = adapter.bind("MSFT.tick");
    let view = adapter.bind("AAPL.tick");
    eventually("connected", || adapter.status() == ConnectionStatus::Connected).await;

    adapter.release(&view);
    adapter.release(&view);
    let before = view.snapshot();

    transport.push_text(r#"[{"topic":"AAPL.tick","price":1},{"topic":"MSFT.tick","price":2}]"#);
    eventually("other view updated", || keep.snapshot().has_value()).await;

    assert!(view.is_released());
    assert_eq!(view.snapshot(), before);
    assert_eq!(adapter.view_count(), 1);
    assert_eq!(adapter.stream().active_topics(), ["MSFT.tick"]);
}

#[tokio::test]
async fn releasing_last_view_closes_connection() {
    let transport = ScriptedTransport::new();
    let adapter = adapter(&transport);

    let view = adapter.bind("AAPL.tick");
    eventually("connected", || adapter.status() == ConnectionStatus::Connected).await;

    adapter.release(&view);

    assert_eq!(adapter.stream().status(), ConnectionStatus::Disconnected);
    eventually("link closed", || transport.close_count() == 1).await;
}

// =============================================================================
// Degraded Status
// =============================================================================

#[tokio::test]
async fn transport_drop_marks_views_reconnecting_then_connected() {
    let transport = ScriptedTransport::new();
    let config = ConnectionConfig {
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(150),
            max_delay: Duration::from_millis(150),
            ..ReconnectConfig::default()
        }
        .without_jitter(),
        heartbeat: None,
    };
    let adapter = ViewStateAdapter::new(stream_over(&transport, config));

    let aapl = adapter.bind("AAPL.tick");
    let msft = adapter.bind("MSFT.tick");
    eventually("joins", || transport.sent_topics("subscribe").len() == 2).await;

    transport.push_text(r#"[{"topic":"AAPL.tick","price":150},{"topic":"MSFT.tick","price":410}]"#);
    eventually("values", || aapl.snapshot().has_value() && msft.snapshot().has_value()).await;

    transport.clear_sent();
    transport.drop_link();

    eventually("both reconnecting", || {
        aapl.snapshot().status == ViewStatus::Reconnecting
            && msft.snapshot().status == ViewStatus::Reconnecting
    })
    .await;
    assert!(aapl.snapshot().status.is_degraded());
    assert_eq!(aapl.snapshot().last_price, Some(Decimal::new(150, 0)));

    eventually("both connected", || {
        aapl.snapshot().status == ViewStatus::Connected
            && msft.snapshot().status == ViewStatus::Connected
    })
    .await;
    eventually("rejoins", || transport.sent_topics("subscribe").len() == 2).await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    let mut joins = transport.sent_topics("subscribe");
    joins.sort();
    assert_eq!(joins, ["AAPL.tick", "MSFT.tick"]);
}

#[tokio::test]
async fn terminal_failure_reaches_views() {
    let transport = ScriptedTransport::with_script([ConnectStep::Fail(
        TransportError::AuthRejected("HTTP 403".to_string()),
    )]);
    let adapter = adapter(&transport);

    let view = adapter.bind("AAPL.tick");
    eventually("failed", || view.snapshot().status == ViewStatus::Failed).await;

    let error = view.snapshot().error.unwrap();
    assert!(error.contains("HTTP 403"), "{error}");

    // Views bound after the failure see it immediately
    let late = adapter.bind("MSFT.tick");
    assert_eq!(late.snapshot().status, ViewStatus::Failed);
    assert!(late.snapshot().error.is_some());

    assert!(adapter.stream().reopen());
    eventually("recovered", || adapter.status() == ConnectionStatus::Connected).await;
    assert_eq!(view.snapshot().status, ViewStatus::Loading);
    assert!(view.snapshot().error.is_none());
}
