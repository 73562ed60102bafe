use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tsdb_core::{
    DbParams, DictDb, FieldDef, FieldType, FieldValue, IndexKind, PersistentDb, Row, Schema, TimeSeries,
    TimeSeriesDb,
};
use tsdb_server::procs::kernel_distance;
use tsdb_server::serialization::{serialize, Deserializer};
use tsdb_server::{Return, ServerError, Status, StoredProcedure, TsdbClient, TsdbServer};

const LEN: usize = 16;

fn schema() -> Schema {
    Schema::new(
        vec![
            FieldDef::new("pk", FieldType::String),
            FieldDef::new("order", FieldType::Int)
                .indexed(IndexKind::Bitmap)
                .with_values((-5..=5).map(FieldValue::Int).collect()),
            FieldDef::new("mean", FieldType::Float).indexed(IndexKind::Tree),
            FieldDef::new("std", FieldType::Float).indexed(IndexKind::Tree),
            FieldDef::new("vp", FieldType::Bool)
                .indexed(IndexKind::Bitmap)
                .with_values(vec![FieldValue::Bool(false), FieldValue::Bool(true)]),
        ],
        "pk",
    )
    .unwrap()
}

struct Running {
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<tsdb_server::Result<()>>,
}

impl Running {
    fn client(&self) -> TsdbClient {
        TsdbClient::new(self.addr.to_string())
    }

    async fn stop(mut self) -> tsdb_server::Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.unwrap()
    }
}

async fn start(server: TsdbServer) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(server.serve_with_shutdown(listener, async {
        let _ = stopped.await;
    }));
    Running {
        addr,
        stop: Some(stop),
        task,
    }
}

async fn start_memory() -> Running {
    start(TsdbServer::new(Box::new(DictDb::new(schema(), LEN).unwrap()))).await
}

fn series(rng: &mut StdRng) -> TimeSeries {
    let times: Vec<f64> = (0..LEN).map(|i| i as f64 / LEN as f64).collect();
    let shift = rng.gen_range(0.0..1.0);
    let values = times
        .iter()
        .map(|t| (-((t - shift) / 0.1f64).powi(2)).exp() + 0.05 * rng.gen_range(-1.0..1.0))
        .collect();
    TimeSeries::new(times, values).unwrap()
}

fn md(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap()
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}

#[tokio::test]
async fn insert_trigger_computes_stats() {
    let server = start_memory().await;
    let client = server.client();
    let (status, _) = client
        .add_trigger("stats", "insert_ts", Some(vec!["mean".into(), "std".into()]), Value::Null)
        .await
        .unwrap();
    assert_eq!(status, Status::Ok);

    let ts = TimeSeries::new((0..LEN).map(|i| i as f64).collect(), (0..LEN).map(|i| (i * i) as f64).collect()).unwrap();
    let (status, _) = client.insert_ts("one", &ts).await.unwrap();
    assert_eq!(status, Status::Ok);

    let fields = Some(vec!["mean".to_string(), "std".to_string()]);
    eventually(|| {
        let client = client.clone();
        let fields = fields.clone();
        async move {
            let (_, payload) = client.select(md(json!({"pk": "one"})), fields, None).await.unwrap();
            payload["one"].get("std").is_some()
        }
    })
    .await;
    let (_, payload) = client.select(md(json!({"pk": "one"})), fields, None).await.unwrap();
    let mean = payload["one"]["mean"].as_f64().unwrap();
    let std = payload["one"]["std"].as_f64().unwrap();
    assert!((mean - ts.mean()).abs() < 1e-9);
    assert!((std - ts.std()).abs() < 1e-9);

    client.remove_trigger("stats", "insert_ts").await.unwrap();
    client.insert_ts("two", &ts).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let (_, payload) = client.select(md(json!({"pk": "two"})), Some(vec![]), None).await.unwrap();
    assert!(payload["two"].get("mean").is_none());
    server.stop().await.unwrap();
}

#[tokio::test]
async fn errors_map_to_statuses() {
    let server = start_memory().await;
    let client = server.client();
    let mut rng = StdRng::seed_from_u64(1);
    let ts = series(&mut rng);
    assert_eq!(client.insert_ts("one", &ts).await.unwrap().0, Status::Ok);

    let (status, payload) = client.insert_ts("one", &ts).await.unwrap();
    assert_eq!(status, Status::InvalidKey);
    assert!(payload[0].as_str().unwrap().contains("one"));

    let (status, _) = client.delete_ts("missing").await.unwrap();
    assert_eq!(status, Status::InvalidOperation);
    let (status, _) = client.upsert_meta("one", md(json!({"order": 99}))).await.unwrap();
    assert_eq!(status, Status::InvalidOperation);
    let (status, _) = client
        .select(Map::new(), None, Some(md(json!({"sort_by": "sideways"}))))
        .await
        .unwrap();
    assert_eq!(status, Status::InvalidOperation);
    let (status, _) = client.add_trigger("nope", "insert_ts", None, Value::Null).await.unwrap();
    assert_eq!(status, Status::InvalidOperation);
    let (status, _) = client.add_trigger("stats", "on_lunch", None, Value::Null).await.unwrap();
    assert_eq!(status, Status::InvalidOperation);
    let (status, _) = client.remove_trigger("stats", "select").await.unwrap();
    assert_eq!(status, Status::Ok);
    server.stop().await.unwrap();
}

async fn raw_exchange(addr: SocketAddr, bytes: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(bytes).await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    out
}

fn decode(bytes: &[u8]) -> Return {
    let mut de = Deserializer::new();
    de.append(bytes).unwrap();
    assert!(de.ready());
    de.deserialize().unwrap()
}

#[tokio::test]
async fn protocol_errors_still_get_a_response() {
    let server = start_memory().await;

    let mut bad_json = 9u32.to_le_bytes().to_vec();
    bad_json.extend_from_slice(b"{op:}");
    let ret = decode(&raw_exchange(server.addr, &bad_json).await);
    assert_eq!(ret.status, Status::InvalidOperation);
    assert_eq!(ret.op, None);

    let ret = decode(&raw_exchange(server.addr, &serialize(&json!({"op": "truncate"})).unwrap()).await);
    assert_eq!(ret.status, Status::InvalidOperation);
    assert_eq!(ret.op.as_deref(), Some("truncate"));

    let ret = decode(&raw_exchange(server.addr, &serialize(&json!({"pk": "one"})).unwrap()).await);
    assert_eq!(ret.status, Status::InvalidOperation);

    let ret = decode(&raw_exchange(server.addr, &serialize(&json!({"op": "insert_ts", "pk": 5})).unwrap()).await);
    assert_eq!(ret.status, Status::InvalidOperation);
    assert_eq!(ret.op.as_deref(), Some("insert_ts"));

    let ret = decode(&raw_exchange(server.addr, &2u32.to_le_bytes()).await);
    assert_eq!(ret.status, Status::InvalidOperation);

    // a half-sent frame followed by a hang-up gets no reply
    let frame = serialize(&json!({"op": "select"})).unwrap();
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(&frame[..frame.len() - 2]).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    assert!(out.is_empty());

    // the server keeps serving
    let (status, _) = server.client().select(Map::new(), None, None).await.unwrap();
    assert_eq!(status, Status::Ok);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn frames_may_arrive_in_pieces() {
    let server = start_memory().await;
    let mut rng = StdRng::seed_from_u64(2);
    let ts = series(&mut rng);
    let frame = serialize(&json!({"op": "insert_ts", "pk": "chunked", "ts": ts})).unwrap();

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.set_nodelay(true).unwrap();
    for piece in frame.chunks(7) {
        stream.write_all(piece).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    let ret = decode(&out);
    assert_eq!(ret.status, Status::Ok);
    assert_eq!(ret.op.as_deref(), Some("insert_ts"));

    let (_, payload) = server
        .client()
        .select(md(json!({"pk": "chunked"})), Some(vec!["ts".into()]), None)
        .await
        .unwrap();
    assert_eq!(payload["chunked"]["ts"], serde_json::to_value(&ts).unwrap());
    server.stop().await.unwrap();
}

#[tokio::test]
async fn select_and_augmented_select_keep_result_order() {
    let server = start_memory().await;
    let client = server.client();
    let mut rng = StdRng::seed_from_u64(3);
    let orders = [2, -3, 5, 0, 1];
    let mut inserted = Vec::new();
    for (i, order) in orders.iter().enumerate() {
        let pk = format!("ts{i}");
        let ts = series(&mut rng);
        client.insert_ts(&pk, &ts).await.unwrap();
        client.upsert_meta(&pk, md(json!({"order": order}))).await.unwrap();
        inserted.push((pk, ts));
    }

    let (status, payload) = client
        .select(Map::new(), Some(vec!["order".into()]), Some(md(json!({"sort_by": "-order", "limit": 3}))))
        .await
        .unwrap();
    assert_eq!(status, Status::Ok);
    let keys: Vec<&String> = payload.as_object().unwrap().keys().collect();
    assert_eq!(keys, vec!["ts2", "ts0", "ts4"]);
    assert_eq!(payload["ts2"], json!({"order": 5}));

    let query = inserted[1].1.clone();
    let (status, payload) = client
        .augmented_select(
            "corr",
            Some(vec!["d".into()]),
            serde_json::to_value(&query).unwrap(),
            md(json!({"order": {">=": 0}})),
            Some(md(json!({"sort_by": "+order"}))),
        )
        .await
        .unwrap();
    assert_eq!(status, Status::Ok);
    let keys: Vec<&String> = payload.as_object().unwrap().keys().collect();
    assert_eq!(keys, vec!["ts3", "ts4", "ts0", "ts2"]);
    for (pk, ts) in &inserted {
        if let Some(entry) = payload.get(pk) {
            let d = entry["d"].as_f64().unwrap();
            assert!((d - kernel_distance(ts.values(), query.values())).abs() < 1e-9);
        }
    }

    let (status, payload) = client
        .augmented_select("stats", None, Value::Null, md(json!({"pk": "ts1"})), None)
        .await
        .unwrap();
    assert_eq!(status, Status::Ok);
    assert_eq!(payload["ts1"].as_array().unwrap().len(), 2);
    server.stop().await.unwrap();
}

fn brute_force(inserted: &[(String, TimeSeries)], query: &TimeSeries) -> (String, f64) {
    inserted
        .iter()
        .map(|(pk, ts)| (pk.clone(), kernel_distance(ts.values(), query.values())))
        .min_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
        .unwrap()
}

#[tokio::test]
async fn find_similar_matches_brute_force() {
    let server = start_memory().await;
    let client = server.client();

    let (status, _) = client.find_similar(&TimeSeries::new(vec![0.0; LEN], vec![0.0; LEN]).unwrap(), None).await.unwrap();
    assert_eq!(status, Status::InvalidOperation);

    let mut rng = StdRng::seed_from_u64(4);
    let mut inserted = Vec::new();
    for i in 0..40 {
        let pk = format!("ts-{i:02}");
        let ts = series(&mut rng);
        client.insert_ts(&pk, &ts).await.unwrap();
        if i % 8 == 0 {
            client.upsert_meta(&pk, md(json!({"vp": true}))).await.unwrap();
        }
        inserted.push((pk, ts));
    }

    let queries: Vec<TimeSeries> = (0..10).map(|_| series(&mut rng)).collect();
    for q in &queries {
        let (status, payload) = client.find_similar(q, None).await.unwrap();
        assert_eq!(status, Status::Ok);
        let (pk, d) = brute_force(&inserted, q);
        assert!((payload[&pk].as_f64().unwrap() - d).abs() < 1e-9, "{payload} vs {pk}");
    }

    let (status, _) = client.make_vp_tree().await.unwrap();
    assert_eq!(status, Status::Ok);
    for (pk, ts) in inserted.iter().take(10) {
        let (status, payload) = client.find_similar(ts, None).await.unwrap();
        assert_eq!(status, Status::Ok);
        assert!(payload[pk].as_f64().unwrap() < 1e-6, "{payload} should contain {pk}");
    }

    // novel queries may miss the global nearest, but the reported distance
    // is always the exact one to the returned row
    for q in &queries {
        let (status, payload) = client.find_similar(q, None).await.unwrap();
        assert_eq!(status, Status::Ok);
        let (pk, dist) = payload.as_object().unwrap().iter().next().unwrap();
        let ts = &inserted.iter().find(|(k, _)| k == pk).unwrap().1;
        assert!((dist.as_f64().unwrap() - kernel_distance(ts.values(), q.values())).abs() < 1e-9);
        assert!(dist.as_f64().unwrap() >= brute_force(&inserted, q).1 - 1e-9);
    }

    // rows deleted after the tree was built are never returned
    client.delete_ts("ts-03").await.unwrap();
    let (status, payload) = client.find_similar(&inserted[3].1, None).await.unwrap();
    assert_eq!(status, Status::Ok);
    assert!(payload.get("ts-03").is_none());
    assert_eq!(payload.as_object().unwrap().len(), 1);

    let (status, _) = client.find_similar(&TimeSeries::new(vec![0.0], vec![1.0]).unwrap(), None).await.unwrap();
    assert_eq!(status, Status::InvalidOperation);
    server.stop().await.unwrap();
}

/// Records the rows it is triggered with.
struct Recorder(Arc<Mutex<Vec<Row>>>);

impl StoredProcedure for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn proc_main(&self, _pk: &str, row: &Row, _arg: &Value) -> tsdb_server::Result<Vec<Value>> {
        self.0
            .lock()
            .map_err(|e| ServerError::Procedure(e.to_string()))?
            .push(row.clone());
        Ok(vec![])
    }
}

#[tokio::test]
async fn delete_triggers_see_the_row_before_deletion() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let server = start(
        TsdbServer::new(Box::new(DictDb::new(schema(), LEN).unwrap()))
            .with_procedure(Arc::new(Recorder(seen.clone()))),
    )
    .await;
    let client = server.client();
    let mut rng = StdRng::seed_from_u64(5);
    let ts = series(&mut rng);
    client.insert_ts("gone", &ts).await.unwrap();
    client.upsert_meta("gone", md(json!({"order": 4}))).await.unwrap();
    assert_eq!(
        client.add_trigger("recorder", "delete_ts", None, Value::Null).await.unwrap().0,
        Status::Ok
    );
    assert_eq!(client.delete_ts("gone").await.unwrap().0, Status::Ok);

    eventually(|| {
        let seen = seen.clone();
        async move { !seen.lock().unwrap().is_empty() }
    })
    .await;
    let rows = seen.lock().unwrap().clone();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].pk, "gone");
    assert_eq!(rows[0].ts, ts);
    assert_eq!(rows[0].get("order"), Some(&FieldValue::Int(4)));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn shutdown_closes_the_persistent_database() {
    let dir = TempDir::new().unwrap();
    let params = DbParams {
        ts_length: LEN,
        refresh: 1000,
        ..Default::default()
    };
    let db = PersistentDb::open(dir.path(), "served", Some(schema()), params.clone()).unwrap();
    let server = start(TsdbServer::new(Box::new(db))).await;
    let client = server.client();
    let mut rng = StdRng::seed_from_u64(6);
    let ts = series(&mut rng);
    client.insert_ts("kept", &ts).await.unwrap();
    client.upsert_meta("kept", md(json!({"mean": 0.5}))).await.unwrap();
    server.stop().await.unwrap();

    let mut db = PersistentDb::open(dir.path(), "served", None, params).unwrap();
    let row = db.get("kept").unwrap();
    assert_eq!(row.ts, ts);
    assert_eq!(row.get("mean"), Some(&FieldValue::Float(0.5)));
}

#[tokio::test]
async fn concurrent_clients_each_get_their_own_reply() {
    let server = start_memory().await;
    let client = server.client();
    let mut rng = StdRng::seed_from_u64(11);
    let inserts = (0..20).map(|i| {
        let client = client.clone();
        let ts = series(&mut rng);
        async move { client.insert_ts(&format!("c-{i:02}"), &ts).await }
    });
    let replies = futures::future::join_all(inserts.collect::<Vec<_>>()).await;
    assert!(replies.iter().all(|r| matches!(r, Ok((Status::Ok, _)))));

    let upserts = (0..20).map(|i| {
        let client = client.clone();
        async move {
            client
                .upsert_meta(&format!("c-{i:02}"), md(json!({"order": i % 5})))
                .await
        }
    });
    futures::future::join_all(upserts).await;

    let (status, payload) = client
        .select(md(json!({"order": 3})), Some(vec!["order".into()]), None)
        .await
        .unwrap();
    assert_eq!(status, Status::Ok);
    let keys: Vec<&String> = payload.as_object().unwrap().keys().collect();
    assert_eq!(keys, ["c-03", "c-08", "c-13", "c-18"]);

    server.stop().await.unwrap();
}

/// Blocks its caller until released, or for a second at most.
struct Stall {
    started: Arc<AtomicBool>,
    release: Arc<AtomicBool>,
}

impl StoredProcedure for Stall {
    fn name(&self) -> &str {
        "stall"
    }

    fn proc_main(&self, _pk: &str, _row: &Row, _arg: &Value) -> tsdb_server::Result<Vec<Value>> {
        self.started.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(1);
        while !self.release.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(vec![Value::Null])
    }
}

#[tokio::test]
async fn slow_requests_do_not_stall_the_runtime() {
    let started = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let server = start(
        TsdbServer::new(Box::new(DictDb::new(schema(), LEN).unwrap())).with_procedure(Arc::new(Stall {
            started: started.clone(),
            release: release.clone(),
        })),
    )
    .await;
    let client = server.client();
    let mut rng = StdRng::seed_from_u64(9);
    client.insert_ts("a", &series(&mut rng)).await.unwrap();

    let t = Instant::now();
    let slow = {
        let client = client.clone();
        tokio::spawn(async move { client.augmented_select("stall", None, Value::Null, Map::new(), None).await })
    };
    // this single-threaded runtime keeps running while the procedure blocks
    eventually(|| {
        let started = started.clone();
        async move { started.load(Ordering::SeqCst) }
    })
    .await;
    release.store(true, Ordering::SeqCst);
    let (status, _) = slow.await.unwrap().unwrap();
    assert_eq!(status, Status::Ok);
    assert!(t.elapsed() < Duration::from_millis(800), "{:?}", t.elapsed());

    server.stop().await.unwrap();
}
