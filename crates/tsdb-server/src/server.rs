//! TCP front end and the dispatcher that owns the database.
//!
//! Connections never touch the engine. Each one decodes a single request,
//! hands it to the dispatcher over a channel and writes back the reply. The
//! dispatcher runs on a blocking thread, so disk I/O and the rayon distance
//! passes never stall the async workers. Trigger procedures run as detached
//! tasks and send their writes through the same channel.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use rayon::prelude::*;
use serde_json::{json, Map, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tsdb_core::{Row, TimeSeries, TimeSeriesDb, TsdbError, VpTree};
use uuid::Uuid;

use crate::error::{Result, ServerError};
use crate::ops::{Op, Return};
use crate::procs::{self, ProcRegistry, StoredProcedure};
use crate::serialization::{read_frame, write_frame};
use crate::triggers::{Trigger, TriggerEvent, TriggerRegistry};

const CHANNEL_DEPTH: usize = 1024;

/// Field flagging a row as a vantage point.
pub const VP_FIELD: &str = "vp";
/// Optional field ordering the vantage points.
pub const VP_NUM_FIELD: &str = "vp_num";

enum Command {
    Request {
        op: Op,
        reply: oneshot::Sender<Return>,
    },
    ApplyTrigger {
        pk: String,
        md: Map<String, Value>,
    },
    Shutdown {
        done: oneshot::Sender<Result<()>>,
    },
}

pub struct TsdbServer {
    db: Box<dyn TimeSeriesDb>,
    procs: ProcRegistry,
}

impl TsdbServer {
    pub fn new(db: Box<dyn TimeSeriesDb>) -> Self {
        Self {
            db,
            procs: ProcRegistry::with_builtins(),
        }
    }

    /// Makes `proc` available to augmented selects and triggers.
    pub fn with_procedure(mut self, proc: Arc<dyn StoredProcedure>) -> Self {
        self.procs.register(proc);
        self
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves, then closes the
    /// database once every request already queued has been answered.
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let dispatcher = Dispatcher {
            db: self.db,
            procs: self.procs,
            triggers: TriggerRegistry::new(),
            vptree: None,
            tx: tx.downgrade(),
        };
        let worker = tokio::task::spawn_blocking(move || dispatcher.run(rx));

        if let Ok(addr) = listener.local_addr() {
            tracing::info!("tsdb listening on {addr}");
        }
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let conn = Uuid::new_v4();
                            tracing::debug!(%conn, %peer, "connection opened");
                            handle_connection(stream, conn, tx).await;
                        });
                    }
                    Err(e) => tracing::warn!("accept failed: {e}"),
                },
            }
        }

        tracing::info!("shutting down");
        let (done, finished) = oneshot::channel();
        tx.send(Command::Shutdown { done })
            .await
            .map_err(|_| ServerError::Unavailable)?;
        let closed = finished.await.map_err(|_| ServerError::Unavailable)?;
        if let Err(e) = worker.await {
            tracing::warn!("dispatcher task failed: {e}");
        }
        closed
    }
}

async fn handle_connection(mut stream: TcpStream, conn: Uuid, tx: mpsc::Sender<Command>) {
    let ret = match read_frame::<_, Value>(&mut stream).await {
        Ok(Some(msg)) => dispatch(msg, &tx).await,
        Ok(None) => {
            tracing::debug!(%conn, "peer closed before sending a full frame");
            return;
        }
        Err(ServerError::Io(e)) => {
            tracing::warn!(%conn, "reading request failed: {e}");
            return;
        }
        Err(e) => Return::error(None, &e),
    };
    tracing::debug!(%conn, op = ?ret.op, status = ?ret.status, "request handled");
    if let Err(e) = write_frame(&mut stream, &ret).await {
        tracing::warn!(%conn, "writing response failed: {e}");
    }
}

async fn dispatch(msg: Value, tx: &mpsc::Sender<Command>) -> Return {
    let tag = msg.get("op").and_then(Value::as_str).map(str::to_string);
    let op = match Op::from_json(msg) {
        Ok(op) => op,
        Err(e) => return Return::error(tag, &e),
    };
    let (reply, response) = oneshot::channel();
    if tx.send(Command::Request { op, reply }).await.is_err() {
        return Return::error(tag, &ServerError::Unavailable);
    }
    match response.await {
        Ok(ret) => ret,
        Err(_) => Return::error(tag, &ServerError::Unavailable),
    }
}

/// Sole owner of the engine; applies commands one at a time.
struct Dispatcher {
    db: Box<dyn TimeSeriesDb>,
    procs: ProcRegistry,
    triggers: TriggerRegistry,
    vptree: Option<VpTree>,
    // weak, so the channel closes once every connection and trigger is gone
    tx: mpsc::WeakSender<Command>,
}

impl Dispatcher {
    fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                Command::Request { op, reply } => {
                    let ret = self.handle(op);
                    // the client may have hung up; nothing to do then
                    let _ = reply.send(ret);
                }
                Command::ApplyTrigger { pk, md } => self.apply_trigger(&pk, &md),
                Command::Shutdown { done } => {
                    let closed = self.db.close().map_err(ServerError::from);
                    let _ = done.send(closed);
                    return;
                }
            }
        }
        if let Err(e) = self.db.close() {
            tracing::warn!("closing database failed: {e}");
        }
    }

    fn handle(&mut self, op: Op) -> Return {
        let name = op.name();
        tracing::debug!(op = name, "dispatching");
        match self.execute(op) {
            Ok(payload) => Return::ok(name, payload),
            Err(e) => {
                tracing::debug!(op = name, "request failed: {e}");
                Return::error(Some(name.to_string()), &e)
            }
        }
    }

    fn execute(&mut self, op: Op) -> Result<Value> {
        match op {
            Op::InsertTs { pk, ts } => {
                self.db.insert_ts(&pk, &ts)?;
                self.fire_for_keys(TriggerEvent::InsertTs, std::slice::from_ref(&pk));
                Ok(Value::Null)
            }
            Op::UpsertMeta { pk, md } => {
                self.db.upsert_meta(&pk, &md)?;
                self.fire_for_keys(TriggerEvent::UpsertMeta, std::slice::from_ref(&pk));
                Ok(Value::Null)
            }
            Op::DeleteTs { pk } => {
                let before = if self.triggers.for_event(TriggerEvent::DeleteTs).is_empty() {
                    None
                } else {
                    Some(self.db.get(&pk)?)
                };
                self.db.delete_ts(&pk)?;
                if let Some(row) = before {
                    self.fire(TriggerEvent::DeleteTs, vec![row]);
                }
                Ok(Value::Null)
            }
            Op::Select {
                md,
                fields,
                additional,
            } => {
                let sel = self.db.select(&md, fields.as_deref(), additional.as_ref())?;
                self.fire_for_keys(TriggerEvent::Select, &sel.keys);
                Ok(Value::Object(sel.into_map()))
            }
            Op::AugmentedSelect {
                proc,
                target,
                arg,
                md,
                additional,
            } => self.augmented_select(&proc, target.as_deref(), &arg, &md, additional.as_ref()),
            Op::AddTrigger {
                proc,
                onwhat,
                target,
                arg,
            } => {
                let event: TriggerEvent = onwhat.parse()?;
                let proc = self.procs.get(&proc)?;
                tracing::info!(proc = proc.name(), %event, "trigger added");
                self.triggers.add(event, Trigger { proc, arg, target });
                Ok(Value::Null)
            }
            Op::RemoveTrigger { proc, onwhat } => {
                let event: TriggerEvent = onwhat.parse()?;
                let removed = self.triggers.remove(event, &proc);
                tracing::info!(%proc, %event, removed, "trigger removed");
                Ok(Value::Null)
            }
            Op::FindSimilar { arg, vpkeys } => self.find_similar(&arg, vpkeys),
            Op::MakeVpTree => self.make_vp_tree(),
        }
    }

    fn fire_for_keys(&mut self, event: TriggerEvent, keys: &[String]) {
        if self.triggers.for_event(event).is_empty() {
            return;
        }
        let mut rows = Vec::with_capacity(keys.len());
        for pk in keys {
            match self.db.get(pk) {
                Ok(row) => rows.push(row),
                Err(e) => tracing::warn!(%pk, %event, "cannot load row for triggers: {e}"),
            }
        }
        self.fire(event, rows);
    }

    /// Starts every trigger registered for `event` on every row. Results come
    /// back later as `ApplyTrigger` commands; nothing here waits for them.
    fn fire(&self, event: TriggerEvent, rows: Vec<Row>) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        for trigger in self.triggers.for_event(event) {
            for row in &rows {
                let trigger = trigger.clone();
                let row = row.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let pk = row.pk.clone();
                    let values = match trigger.proc.main(&pk, &row, &trigger.arg).await {
                        Ok(values) => values,
                        Err(e) => {
                            tracing::warn!(proc = trigger.proc.name(), %pk, "trigger procedure failed: {e}");
                            return;
                        }
                    };
                    let Some(target) = trigger.target else {
                        return;
                    };
                    let md: Map<String, Value> = target.into_iter().zip(values).collect();
                    if tx.send(Command::ApplyTrigger { pk, md }).await.is_err() {
                        tracing::warn!(proc = trigger.proc.name(), "trigger result dropped: server is shutting down");
                    }
                });
            }
        }
    }

    /// Trigger writes are applied in arrival order, so a trigger result may
    /// overwrite a later client write to the same key. A per-key
    /// `WriteSequencer` would order them here. Trigger writes never fire
    /// triggers themselves.
    fn apply_trigger(&mut self, pk: &str, md: &Map<String, Value>) {
        match self.db.upsert_meta(pk, md) {
            Ok(()) => tracing::debug!(%pk, "trigger result applied"),
            Err(e) => tracing::warn!(%pk, "trigger upsert failed: {e}"),
        }
    }

    fn augmented_select(
        &mut self,
        proc: &str,
        target: Option<&[String]>,
        arg: &Value,
        md: &Map<String, Value>,
        additional: Option<&Map<String, Value>>,
    ) -> Result<Value> {
        let proc = self.procs.get(proc)?;
        let sel = self.db.select(md, None, additional)?;
        let rows = sel
            .keys
            .iter()
            .map(|pk| self.db.get(pk))
            .collect::<std::result::Result<Vec<Row>, TsdbError>>()?;
        let results = rows
            .par_iter()
            .map(|row| proc.proc_main(&row.pk, row, arg))
            .collect::<Result<Vec<Vec<Value>>>>()?;

        let mut payload = Map::new();
        for (row, values) in rows.into_iter().zip(results) {
            let value = match target {
                Some(names) => Value::Object(names.iter().cloned().zip(values).collect()),
                None => Value::Array(values),
            };
            payload.insert(row.pk, value);
        }
        Ok(Value::Object(payload))
    }

    fn standardized(&mut self, pk: &str) -> Result<Vec<f64>> {
        Ok(procs::standardize(self.db.get(pk)?.ts.values()))
    }

    /// Builds the tree over every live row, splitting on rows whose `vp`
    /// field is true.
    fn make_vp_tree(&mut self) -> Result<Value> {
        if !self.db.schema().contains(VP_FIELD) {
            return Err(TsdbError::Validation(format!(
                "a vantage-point tree needs a '{VP_FIELD}' field in the schema"
            ))
            .into());
        }
        let fields = [VP_FIELD.to_string()];
        let sel = self.db.select(&Map::new(), Some(&fields), None)?;
        let vantage_points: Vec<String> = sel
            .keys
            .iter()
            .zip(&sel.rows)
            .filter(|(_, row)| row.get(VP_FIELD) == Some(&Value::Bool(true)))
            .map(|(pk, _)| pk.clone())
            .collect();

        let mut series = HashMap::with_capacity(sel.keys.len());
        for pk in &sel.keys {
            series.insert(pk.clone(), self.standardized(pk)?);
        }
        let tree = VpTree::build(
            sel.keys,
            vantage_points,
            |vp, keys| {
                let v = &series[vp];
                keys.par_iter()
                    .map(|k| procs::standardized_distance(v, &series[k.as_str()]))
                    .collect()
            },
            &mut rand::thread_rng(),
        );
        tracing::info!(rows = tree.len(), depth = tree.depth(), "built vantage-point tree");
        self.vptree = Some(tree);
        Ok(Value::Null)
    }

    /// Nearest live row to `query` by kernel-correlation distance, as
    /// `{pk: distance}`.
    fn find_similar(&mut self, query: &TimeSeries, vpkeys: Option<Vec<String>>) -> Result<Value> {
        if self.db.is_empty() {
            return Err(TsdbError::NotFound("database is empty".into()).into());
        }
        if query.len() != self.db.ts_length() {
            return Err(TsdbError::LengthMismatch {
                expected: self.db.ts_length(),
                actual: query.len(),
            }
            .into());
        }
        let q = procs::standardize(query.values());

        let from_tree = match self.vptree.take() {
            Some(tree) => {
                let subset = tree
                    .close_subset(|vp| match self.standardized(vp) {
                        Ok(v) => procs::standardized_distance(&v, &q),
                        Err(e) => {
                            tracing::debug!(%vp, "vantage point unavailable: {e}");
                            f64::INFINITY
                        }
                    })
                    .to_vec();
                self.vptree = Some(tree);
                self.closest(&q, &subset)?
            }
            None => None,
        };
        // a leaf whose rows were all deleted since the build falls through
        let best = match from_tree {
            Some(best) => Some(best),
            None => {
                let candidates = self.within_vantage_radius(&q, vpkeys)?;
                self.closest(&q, &candidates)?
            }
        };
        let (pk, dist) = best.ok_or_else(|| TsdbError::NotFound("no similar series".into()))?;
        let mut payload = Map::new();
        payload.insert(pk, json!(dist));
        Ok(Value::Object(payload))
    }

    /// Rows no farther from the vantage point nearest to `q` than twice that
    /// distance; the nearest row to `q` is always among them.
    fn within_vantage_radius(&mut self, q: &[f64], vpkeys: Option<Vec<String>>) -> Result<Vec<String>> {
        let vantage_points = match vpkeys {
            Some(keys) => keys,
            None if self.db.schema().contains(VP_FIELD) => {
                let mut filter = Map::new();
                filter.insert(VP_FIELD.to_string(), Value::Bool(true));
                let sort = self
                    .db
                    .schema()
                    .contains(VP_NUM_FIELD)
                    .then(|| json!({ "sort_by": format!("+{VP_NUM_FIELD}") }))
                    .and_then(|v| v.as_object().cloned());
                self.db.select(&filter, None, sort.as_ref())?.keys
            }
            None => Vec::new(),
        };

        let Some((pos, vp, radius)) = self.nearest_vantage_point(q, &vantage_points)? else {
            // nothing to prune with: scan everything
            return Ok(self.db.select(&Map::new(), None, None)?.keys);
        };
        let radius = 2.0 * radius;

        let column = format!("d_vp-{pos}");
        if self.db.schema().contains(&column) {
            let mut filter = Map::new();
            filter.insert(column, json!({ "<=": radius }));
            return Ok(self.db.select(&filter, None, None)?.keys);
        }
        let all = self.db.select(&Map::new(), None, None)?.keys;
        let v = self.standardized(&vp)?;
        let mut series = Vec::with_capacity(all.len());
        for pk in all {
            let s = self.standardized(&pk)?;
            series.push((pk, s));
        }
        Ok(series
            .into_par_iter()
            .filter(|(_, s)| procs::standardized_distance(&v, s) <= radius)
            .map(|(pk, _)| pk)
            .collect())
    }

    /// `(position, key, distance)` of the closest live vantage point.
    fn nearest_vantage_point(&mut self, q: &[f64], vantage_points: &[String]) -> Result<Option<(usize, String, f64)>> {
        let mut best: Option<(usize, String, f64)> = None;
        for (pos, vp) in vantage_points.iter().enumerate() {
            let v = match self.standardized(vp) {
                Ok(v) => v,
                Err(ServerError::Db(TsdbError::NotFound(_))) => continue,
                Err(e) => return Err(e),
            };
            let d = procs::standardized_distance(&v, q);
            if best.as_ref().map_or(true, |(_, _, b)| d < *b) {
                best = Some((pos, vp.clone(), d));
            }
        }
        Ok(best)
    }

    /// Exact scan of `candidates`; rows deleted since the tree was built are
    /// skipped.
    fn closest(&mut self, q: &[f64], candidates: &[String]) -> Result<Option<(String, f64)>> {
        let mut series = Vec::with_capacity(candidates.len());
        for pk in candidates {
            match self.standardized(pk) {
                Ok(s) => series.push((pk.clone(), s)),
                Err(ServerError::Db(TsdbError::NotFound(_))) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(series
            .into_par_iter()
            .map(|(pk, s)| {
                let d = procs::standardized_distance(&s, q);
                (pk, d)
            })
            .min_by(|(ka, a), (kb, b)| a.total_cmp(b).then_with(|| ka.cmp(kb))))
    }
}
