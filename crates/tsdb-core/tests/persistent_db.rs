use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};
use tempfile::TempDir;
use tsdb_core::{
    DbParams, DictDb, FieldDef, FieldType, FieldValue, IndexKind, PersistentDb, Schema, TimeSeries,
    TimeSeriesDb, TsdbError,
};

const LEN: usize = 8;

fn fields(indexed: bool) -> Vec<FieldDef> {
    let order = FieldDef::new("order", FieldType::Int).with_values((-5..=5).map(FieldValue::Int).collect());
    let mean = FieldDef::new("mean", FieldType::Float);
    let vp = FieldDef::new("vp", FieldType::Bool)
        .with_values(vec![FieldValue::Bool(false), FieldValue::Bool(true)]);
    let (order, mean, vp) = if indexed {
        (
            order.indexed(IndexKind::Bitmap),
            mean.indexed(IndexKind::Tree),
            vp.indexed(IndexKind::Bitmap),
        )
    } else {
        (order, mean, vp)
    };
    vec![FieldDef::new("pk", FieldType::String), order, mean, vp]
}

fn schema(indexed: bool) -> Schema {
    Schema::new(fields(indexed), "pk").unwrap()
}

fn params() -> DbParams {
    DbParams {
        ts_length: LEN,
        refresh: 7,
        ..Default::default()
    }
}

fn series(seed: f64) -> TimeSeries {
    let times: Vec<f64> = (0..LEN).map(|i| i as f64).collect();
    let values = times.iter().map(|t| seed * t + seed.sin()).collect();
    TimeSeries::new(times, values).unwrap()
}

fn md(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap()
}

#[test]
fn test_series_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let inserted: Vec<(String, TimeSeries)> =
        (0..20).map(|i| (format!("ts-{i}"), series(i as f64 * 0.5))).collect();
    {
        let mut db = PersistentDb::open(dir.path(), "db", Some(schema(true)), params()).unwrap();
        for (pk, ts) in &inserted {
            db.insert_ts(pk, ts).unwrap();
        }
        db.upsert_meta("ts-3", &md(json!({"order": -2, "mean": 0.25}))).unwrap();
        // no close: recovery goes through the write log
        std::mem::forget(db);
    }
    let mut db = PersistentDb::open(dir.path(), "db", None, params()).unwrap();
    assert_eq!(db.len(), inserted.len());
    for (pk, ts) in &inserted {
        assert_eq!(&db.get(pk).unwrap().ts, ts);
    }
    let row = db.get("ts-3").unwrap();
    assert_eq!(row.get("order"), Some(&FieldValue::Int(-2)));
    assert_eq!(db.select(&md(json!({"mean": {"<": 1.0}})), None, None).unwrap().keys, vec!["ts-3"]);
}

#[test]
fn test_deleted_key_can_be_reinserted() {
    let dir = TempDir::new().unwrap();
    let mut db = PersistentDb::open(dir.path(), "db", Some(schema(true)), params()).unwrap();
    db.insert_ts("one", &series(1.0)).unwrap();
    db.upsert_meta("one", &md(json!({"order": 3, "mean": 2.0, "vp": true}))).unwrap();
    db.delete_ts("one").unwrap();

    assert_eq!(db.len(), 0);
    assert!(matches!(db.get("one"), Err(TsdbError::NotFound(_))));
    assert!(matches!(db.delete_ts("one"), Err(TsdbError::NotFound(_))));
    for filter in [json!({"order": 3}), json!({"mean": 2.0}), json!({"vp": true}), json!({"pk": "one"})] {
        assert!(db.select(&md(filter), None, None).unwrap().is_empty());
    }

    db.insert_ts("one", &series(2.0)).unwrap();
    let row = db.get("one").unwrap();
    assert_eq!(row.ts, series(2.0));
    assert_eq!(row.get("order"), None);
    assert_eq!(db.select(&md(json!({"vp": false})), None, None).unwrap().keys, vec!["one"]);
    drop(db);

    let mut db = PersistentDb::open(dir.path(), "db", None, params()).unwrap();
    assert_eq!(db.get("one").unwrap().ts, series(2.0));
}

#[test]
fn test_sort_and_limit() {
    let dir = TempDir::new().unwrap();
    let mut db = PersistentDb::open(dir.path(), "db", Some(schema(true)), params()).unwrap();
    let orders = [3, -1, 4, 1, -5, 2, 0];
    for (i, order) in orders.iter().enumerate() {
        let pk = format!("k{i}");
        db.insert_ts(&pk, &series(i as f64)).unwrap();
        db.upsert_meta(&pk, &md(json!({"order": order}))).unwrap();
    }
    let empty: [String; 0] = [];
    let order_of = |row: &Map<String, Value>| row["order"].as_i64().unwrap();

    let asc = db
        .select(&Map::new(), Some(&empty), Some(&md(json!({"sort_by": "+order"}))))
        .unwrap();
    let got: Vec<i64> = asc.rows.iter().map(order_of).collect();
    assert!(got.windows(2).all(|w| w[0] <= w[1]), "{got:?}");

    let desc = db
        .select(&Map::new(), Some(&empty), Some(&md(json!({"sort_by": "-order", "limit": 3}))))
        .unwrap();
    let got: Vec<i64> = desc.rows.iter().map(order_of).collect();
    assert_eq!(got, vec![4, 3, 2]);
    assert_eq!(desc.keys, vec!["k2", "k0", "k5"]);

    let ranged = db
        .select(&md(json!({"order": {">=": 0}})), Some(&["order".to_string()]), None)
        .unwrap();
    assert_eq!(ranged.keys, vec!["k0", "k2", "k3", "k5", "k6"]);
    assert!(ranged.rows.iter().all(|r| r.len() == 1));

    let with_ts = db
        .select(&md(json!({"pk": "k1"})), Some(&["ts".to_string(), "pk".to_string()]), None)
        .unwrap();
    assert_eq!(with_ts.rows[0]["pk"], json!("k1"));
    assert_eq!(with_ts.rows[0]["ts"], serde_json::to_value(series(1.0)).unwrap());

    assert!(matches!(
        db.select(&Map::new(), None, Some(&md(json!({"sort_by": "order"})))),
        Err(TsdbError::Validation(_))
    ));
    assert!(matches!(
        db.select(&Map::new(), None, Some(&md(json!({"limit": "many"})))),
        Err(TsdbError::Validation(_))
    ));
}

/// Runs the same random workload against an indexed database, an unindexed
/// one and the in-memory engine, checking that every select agrees.
#[test]
fn test_index_and_scan_agree() {
    let dir = TempDir::new().unwrap();
    let mut indexed = PersistentDb::open(dir.path(), "indexed", Some(schema(true)), params()).unwrap();
    let mut plain = PersistentDb::open(dir.path(), "plain", Some(schema(false)), params()).unwrap();
    let mut memory = DictDb::new(schema(true), LEN).unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    let mut live: Vec<String> = Vec::new();
    let mut next = 0;

    for step in 0..300 {
        let dbs: [&mut dyn TimeSeriesDb; 3] = [&mut indexed, &mut plain, &mut memory];
        match rng.gen_range(0..10) {
            0..=2 => {
                let pk = format!("k{next}");
                next += 1;
                let ts = series(next as f64);
                for db in dbs {
                    db.insert_ts(&pk, &ts).unwrap();
                }
                live.push(pk);
            }
            3..=7 if !live.is_empty() => {
                let pk = live[rng.gen_range(0..live.len())].clone();
                let update = md(json!({
                    "order": rng.gen_range(-5..=5),
                    "mean": f64::from(rng.gen_range(0..4)) / 2.0,
                    "vp": rng.gen_bool(0.3),
                }));
                for db in dbs {
                    db.upsert_meta(&pk, &update).unwrap();
                }
            }
            8 if !live.is_empty() => {
                let pk = live.swap_remove(rng.gen_range(0..live.len()));
                for db in dbs {
                    db.delete_ts(&pk).unwrap();
                }
            }
            _ => {}
        }

        let filters = [
            json!({"order": rng.gen_range(-5..=5)}),
            json!({"order": {"<": rng.gen_range(-5..=5)}}),
            json!({"mean": f64::from(rng.gen_range(0..4)) / 2.0}),
            json!({"mean": {">=": 1.0}}),
            json!({"mean": {"!=": 0.5}}),
            json!({"vp": true}),
            json!({"vp": false, "order": {">": 0}}),
        ];
        for filter in filters {
            let filter = md(filter);
            let a = indexed.select(&filter, None, None).unwrap().keys;
            let b = plain.select(&filter, None, None).unwrap().keys;
            let c = memory.select(&filter, None, None).unwrap().keys;
            assert_eq!(a, b, "step {step}: {filter:?}");
            assert_eq!(a, c, "step {step}: {filter:?}");
        }
        assert_eq!(indexed.len(), live.len());
    }
}
