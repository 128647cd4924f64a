//! End-to-end pipeline test over the in-process seams: a vendor response is
//! parsed, fetched through the decorator chain by a worker, published as an
//! envelope, then decoded, verified, and mapped the way the collectors
//! project it. No external services involved.

use async_trait::async_trait;
use chrono::TimeZone;
use chrono_tz::Asia::Shanghai;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use quotebus_backend::{
    bus::{stream_for, MemorySink, StreamSink},
    collectors::{
        influx_collector::stock_point,
        redis_collector::{cache_key, stock_hash_fields, symbol_set_key},
        ProcessedSet,
    },
    envelope::{Envelope, Payload},
    fetcher::{
        decorate, jobs::parse_jobs, BreakerConfig, FetcherStats, FetcherWorker, FrequencyConfig,
        SubscriptionManager,
    },
    limiter::LimiterConfig,
    market::OffsetClock,
    models::DataType,
    providers::{tencent, QuoteBatch, QuoteFetcher},
};

/// Two full 49-field vendor records, as Tencent would serve them (GBK).
fn vendor_body() -> Vec<u8> {
    let sh = [
        "1",
        "浦发银行",
        "600000",
        "10.50",
        "10.45",
        "10.40",
        "162325",
        "89000",
        "73325",
        "10.49",
        "1200",
        "10.48",
        "800",
        "10.47",
        "500",
        "10.46",
        "300",
        "10.45",
        "100",
        "10.50",
        "900",
        "10.51",
        "700",
        "10.52",
        "600",
        "10.53",
        "400",
        "10.54",
        "200",
        "",
        "20250821100003",
        "0.05",
        "0.48",
        "10.62",
        "10.35",
        "10.50/162325/170313069",
        "162325",
        "17031",
        "0.56",
        "5.23",
        "",
        "10.62",
        "10.35",
        "2.58",
        "1966.94",
        "2034.52",
        "0.62",
        "11.50",
        "9.41",
    ];
    let sz = [
        "51",
        "平安银行",
        "000001",
        "11.20",
        "11.15",
        "11.10",
        "98700",
        "52000",
        "46700",
        "11.19",
        "600",
        "11.18",
        "400",
        "11.17",
        "300",
        "11.16",
        "200",
        "11.15",
        "100",
        "11.20",
        "500",
        "11.21",
        "400",
        "11.22",
        "300",
        "11.23",
        "200",
        "11.24",
        "100",
        "",
        "20250821100003",
        "0.05",
        "0.45",
        "11.32",
        "11.05",
        "11.20/98700/110544000",
        "98700",
        "11054",
        "0.42",
        "6.10",
        "",
        "11.32",
        "11.05",
        "2.42",
        "1820.00",
        "1950.00",
        "0.71",
        "12.27",
        "10.04",
    ];
    let text = format!(
        "v_sh600000=\"{}\";\nv_sz000001=\"{}\";",
        sh.join("~"),
        sz.join("~")
    );
    let (bytes, _, _) = encoding_rs::GBK.encode(&text);
    bytes.into_owned()
}

fn trading_instant() -> chrono::DateTime<chrono::Utc> {
    Shanghai
        .with_ymd_and_hms(2025, 8, 21, 10, 0, 3)
        .unwrap()
        .with_timezone(&chrono::Utc)
}

/// Provider backed by the captured vendor body, parsed by the real parser.
struct FixtureProvider {
    served: parking_lot::Mutex<u32>,
}

#[async_trait]
impl QuoteFetcher for FixtureProvider {
    fn provider(&self) -> &str {
        "tencent"
    }

    fn data_type(&self) -> DataType {
        DataType::StockRealtime
    }

    async fn fetch(
        &self,
        _cancel: &CancellationToken,
        _symbols: &[String],
    ) -> Result<QuoteBatch, quotebus_backend::providers::FetchError> {
        let mut served = self.served.lock();
        *served += 1;
        if *served > 1 {
            // End the run after one good batch.
            return Err(quotebus_backend::providers::FetchError::Http {
                status: 403,
                detail: "fixture exhausted".to_string(),
            });
        }
        let records = tencent::parse_stock_response(&vendor_body(), trading_instant())?;
        Ok(QuoteBatch::Stocks(records))
    }
}

#[tokio::test]
async fn test_fetch_publish_verify_project() {
    let job = parse_jobs(
        r#"
[[jobs]]
name = "sh-sz-realtime"
schedule = "*/5 * * * * *"
[jobs.provider]
name = "tencent"
type = "stock_realtime"
[jobs.params]
symbols = ["600000", "000001"]
[jobs.output]
stream = "stream:stock:realtime"
"#,
    )
    .unwrap()
    .remove(0);

    let sink = Arc::new(MemorySink::new());
    let clock = Arc::new(OffsetClock::anchored_at(trading_instant()));
    let stats = Arc::new(FetcherStats::new());
    let (subscriptions, _rx) = SubscriptionManager::new(stats.clone());

    let fetcher: Arc<dyn QuoteFetcher> = Arc::new(decorate(
        FixtureProvider {
            served: parking_lot::Mutex::new(0),
        },
        FrequencyConfig {
            min_interval: Duration::from_millis(20),
            max_retries: 3,
            enabled: true,
        },
        BreakerConfig::default(),
    ));
    let worker = FetcherWorker::new(
        job,
        "fetcher-it",
        fetcher,
        LimiterConfig {
            min_interval: Duration::from_millis(20),
            ..LimiterConfig::default()
        },
        sink.clone(),
        clock,
        stats.clone(),
        subscriptions,
    );

    use quotebus_backend::fetcher::JobRunner;
    worker.run(CancellationToken::new()).await;

    // Exactly one envelope with batch size 2 on the configured stream.
    let entries = sink.entries();
    assert_eq!(entries.len(), 1);
    let (stream, bytes) = &entries[0];
    assert_eq!(stream, "stream:stock:realtime");
    assert_eq!(stream, &stream_for("stock_realtime"));

    // The consumer-side path: decode, then verify before projecting.
    let envelope = Envelope::decode(bytes).expect("envelope decodes");
    envelope.verify().expect("checksum verifies");
    assert_eq!(envelope.metadata.batch_size, 2);
    assert_eq!(envelope.metadata.provider, "tencent");
    assert_eq!(envelope.metadata.data_type, DataType::StockRealtime);
    assert_eq!(envelope.metadata.session.as_deref(), Some("morning"));

    let Payload::Stocks(records) = envelope.typed_payload().unwrap() else {
        panic!("payload is not a stock batch");
    };
    assert_eq!(records.len(), 2);
    let sh = records.iter().find(|r| r.symbol == "600000").unwrap();
    assert_eq!(sh.name, "浦发银行");
    assert_eq!(sh.volume, 16_232_500.0); // lots converted to shares
    assert_eq!(sh.turnover, 170_313_069.0);

    // Cache projection mapping for both symbols.
    for record in &records {
        let key = cache_key(DataType::StockRealtime, &record.symbol);
        assert_eq!(key, format!("latest:stock:{}", record.symbol));
        let fields = stock_hash_fields(
            record,
            &envelope.metadata.provider,
            &envelope.metadata.market,
            0,
        );
        assert!(fields.iter().any(|(k, v)| k == "price" && !v.is_empty()));
        assert!(fields
            .iter()
            .any(|(k, v)| k == "provider" && v == "tencent"));
    }
    assert_eq!(symbol_set_key(DataType::StockRealtime), "symbols:stock");

    // TSDB projection mapping.
    let point = stock_point(sh, &envelope.metadata.provider, &envelope.metadata.market);
    assert_eq!(point.measurement, "stock_realtime");
    assert_eq!(point.timestamp, sh.timestamp);
    let line = point.line();
    assert!(line.starts_with("stock_realtime,"));
    assert!(line.contains("symbol=600000"));
}

#[tokio::test]
async fn test_tampered_entry_is_poison_not_projected() {
    let records =
        tencent::parse_stock_response(&vendor_body(), trading_instant()).unwrap();
    let envelope = Envelope::new(
        "fetcher-it",
        "tencent",
        DataType::StockRealtime,
        Payload::Stocks(records),
    )
    .unwrap();

    let text = String::from_utf8(envelope.encode().unwrap()).unwrap();
    let tampered = text.replace("10.5", "42.0").into_bytes();

    // The consumer decodes it fine but verification fails: the entry is
    // poison, to be acked and dropped, never projected.
    let decoded = Envelope::decode(&tampered).expect("still decodes");
    assert!(decoded.verify().is_err());
}

#[tokio::test]
async fn test_duplicate_delivery_is_projected_once() {
    let mut processed = ProcessedSet::new(1000);
    let id = "1692583203000-0".to_string();

    assert!(!processed.contains(&id));
    processed.insert(id.clone());
    // Redelivery of the same entry in the same consumer lifetime is a
    // no-op.
    assert!(processed.contains(&id));
    processed.insert(id.clone());
    assert_eq!(processed.len(), 1);
}

#[tokio::test]
async fn test_roundtrip_through_memory_sink_bytes() {
    let records =
        tencent::parse_stock_response(&vendor_body(), trading_instant()).unwrap();
    let mut envelope = Envelope::new(
        "fetcher-it",
        "tencent",
        DataType::StockRealtime,
        Payload::Stocks(records.clone()),
    )
    .unwrap();
    envelope.set_market_info("cn", Some("morning")).unwrap();

    let sink = MemorySink::new();
    sink.append("stream:stock:realtime", &envelope.encode().unwrap())
        .await
        .unwrap();

    let (_, bytes) = &sink.entries()[0];
    let decoded = Envelope::decode(bytes).unwrap();
    decoded.verify().unwrap();
    assert_eq!(decoded, envelope);
    let Payload::Stocks(roundtripped) = decoded.typed_payload().unwrap() else {
        panic!("payload is not a stock batch");
    };
    assert_eq!(roundtripped, records);
}
