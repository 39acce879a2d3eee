//! Deterministic counter engine driven by the simulator.
//!
//! Each site keeps a map of named counters. Procedures are resolved by name;
//! writes record undo entries so a rollback restores the previous values.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use holo_dtxn::dtxn::{
    ClientResponse, DependencyId, DependencyResults, ExecutionEngine, FragmentBatch, FragmentTask,
    Invocation, PlanFragment, ProcedureStep, ResponseStatus, ResultTable, SiteId, TxnId, TxnMeta,
};
use serde::{Deserialize, Serialize};

/// Per-partition results of a multipartition procedure.
pub const PARTITION_RESULT: DependencyId = DependencyId::multipartition(1);

const SUM_FRAGMENT: u64 = 1;
const INCREMENT_FRAGMENT: u64 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Procedure {
    /// Add `delta` to one counter.
    Increment,
    /// Read one counter.
    Read,
    /// Add `delta` to the counter on every partition.
    IncrementAll,
    /// Sum every counter on every partition.
    SumAll,
    /// Write, then abort.
    Abort,
    /// Answer with the executing site's id.
    WhoAmI,
}

impl Procedure {
    pub const ALL: [Procedure; 6] = [
        Procedure::Increment,
        Procedure::Read,
        Procedure::IncrementAll,
        Procedure::SumAll,
        Procedure::Abort,
        Procedure::WhoAmI,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Procedure::Increment => "increment",
            Procedure::Read => "read",
            Procedure::IncrementAll => "increment_all",
            Procedure::SumAll => "sum_all",
            Procedure::Abort => "abort",
            Procedure::WhoAmI => "who_am_i",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    pub fn read_only(self) -> bool {
        matches!(self, Procedure::Read | Procedure::SumAll | Procedure::WhoAmI)
    }

    pub fn multi_partition(self) -> bool {
        matches!(self, Procedure::IncrementAll | Procedure::SumAll)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterArgs {
    pub key: String,
    pub delta: i64,
}

impl CounterArgs {
    pub fn new(key: impl Into<String>, delta: i64) -> Self {
        Self {
            key: key.into(),
            delta,
        }
    }

    pub fn invocation(&self, procedure: Procedure) -> anyhow::Result<Invocation> {
        let params = serde_json::to_vec(self).context("encode counter args")?;
        Ok(Invocation::new(procedure.name(), params))
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(bytes).context("decode counter args")
    }
}

pub fn encode_value(value: i64) -> ResultTable {
    ResultTable::new(value.to_le_bytes().to_vec())
}

pub fn decode_value(table: &ResultTable) -> anyhow::Result<i64> {
    let bytes: [u8; 8] = table
        .as_bytes()
        .try_into()
        .map_err(|_| anyhow::anyhow!("result table is {} bytes, not 8", table.as_bytes().len()))?;
    Ok(i64::from_le_bytes(bytes))
}

/// One finished transaction as a site's engine saw it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutedTxn {
    pub txn_id: TxnId,
    pub procedure: Option<String>,
    pub rolled_back: bool,
}

pub type ExecutionLog = Arc<Mutex<Vec<ExecutedTxn>>>;

#[derive(Debug)]
struct Running {
    procedure: Procedure,
    sql_hash: [u8; 32],
}

#[derive(Debug)]
pub struct CounterEngine {
    site_id: SiteId,
    counters: BTreeMap<String, i64>,
    /// Previous values of counters written by the running transaction.
    undo: Vec<(String, Option<i64>)>,
    running: BTreeMap<TxnId, Running>,
    fragment_procedure: BTreeMap<TxnId, Procedure>,
    log: ExecutionLog,
}

impl CounterEngine {
    pub fn new(site_id: SiteId, log: ExecutionLog) -> Self {
        Self {
            site_id,
            counters: BTreeMap::new(),
            undo: Vec::new(),
            running: BTreeMap::new(),
            fragment_procedure: BTreeMap::new(),
            log,
        }
    }

    pub fn counter(&self, key: &str) -> i64 {
        self.counters.get(key).copied().unwrap_or_default()
    }

    fn add(&mut self, key: &str, delta: i64) -> i64 {
        let previous = self.counters.get(key).copied();
        self.undo.push((key.to_string(), previous));
        let value = previous.unwrap_or_default() + delta;
        self.counters.insert(key.to_string(), value);
        value
    }

    fn rollback(&mut self) {
        while let Some((key, previous)) = self.undo.pop() {
            match previous {
                Some(value) => self.counters.insert(key, value),
                None => self.counters.remove(&key),
            };
        }
    }

    fn fan_out(txn: &TxnMeta, fragment_id: u64, params: Vec<u8>) -> ProcedureStep {
        let task = FragmentTask {
            txn_id: txn.txn_id,
            initiator_id: txn.initiator_id,
            coordinator_id: txn.coordinator_id,
            read_only: txn.read_only,
            sysproc: false,
            is_final: true,
            fragments: vec![PlanFragment {
                fragment_id,
                params,
                input_dependency: None,
                output_dependency: PARTITION_RESULT,
            }],
            attached_inputs: BTreeMap::new(),
        };
        ProcedureStep::Dispatch(vec![FragmentBatch {
            distributed: Some(task),
            local: None,
            resume_on: vec![PARTITION_RESULT],
            is_final: true,
        }])
    }
}

fn sql_hash(invocation: &Invocation) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(invocation.procedure.as_bytes());
    hasher.update(&invocation.params);
    *hasher.finalize().as_bytes()
}

impl ExecutionEngine for CounterEngine {
    fn start_procedure(
        &mut self,
        txn: &TxnMeta,
        invocation: &Invocation,
    ) -> anyhow::Result<ProcedureStep> {
        let procedure = Procedure::from_name(&invocation.procedure)
            .with_context(|| format!("unknown procedure {}", invocation.procedure))?;
        let args = CounterArgs::decode(&invocation.params)?;
        let hash = sql_hash(invocation);
        self.running.insert(
            txn.txn_id,
            Running {
                procedure,
                sql_hash: hash,
            },
        );
        let done = |response: ClientResponse| ProcedureStep::Complete(response.with_sql_hash(hash));
        let step = match procedure {
            Procedure::Increment => {
                let value = self.add(&args.key, args.delta);
                done(ClientResponse::success(vec![encode_value(value)]))
            }
            Procedure::Read => done(ClientResponse::success(vec![encode_value(
                self.counter(&args.key),
            )])),
            Procedure::Abort => {
                self.add(&args.key, args.delta);
                done(ClientResponse::failure(
                    ResponseStatus::UserAbort,
                    format!("aborted after writing {}", args.key),
                ))
            }
            Procedure::WhoAmI => done(ClientResponse::success(vec![encode_value(
                self.site_id as i64,
            )])),
            Procedure::SumAll => Self::fan_out(txn, SUM_FRAGMENT, Vec::new()),
            Procedure::IncrementAll => {
                Self::fan_out(txn, INCREMENT_FRAGMENT, invocation.params.clone())
            }
        };
        Ok(step)
    }

    fn resume_procedure(
        &mut self,
        txn: &TxnMeta,
        inputs: &DependencyResults,
    ) -> anyhow::Result<ProcedureStep> {
        let running = self
            .running
            .get(&txn.txn_id)
            .with_context(|| format!("txn {} resumed without starting", txn.txn_id))?;
        if let Some(failure) = &inputs.failure {
            return Ok(ProcedureStep::Complete(
                ClientResponse::failure(ResponseStatus::UnexpectedFailure, failure.clone())
                    .with_sql_hash(running.sql_hash),
            ));
        }
        let mut total = 0i64;
        for table in inputs.get(PARTITION_RESULT) {
            total += decode_value(table)?;
        }
        tracing::trace!(
            txn_id = %txn.txn_id,
            procedure = running.procedure.name(),
            total,
            "multipartition procedure resumed"
        );
        Ok(ProcedureStep::Complete(
            ClientResponse::success(vec![encode_value(total)]).with_sql_hash(running.sql_hash),
        ))
    }

    fn execute_fragment(
        &mut self,
        txn: &TxnMeta,
        task: &FragmentTask,
        _inputs: &DependencyResults,
    ) -> anyhow::Result<Vec<(DependencyId, ResultTable)>> {
        let mut outputs = Vec::with_capacity(task.fragments.len());
        for fragment in &task.fragments {
            let value = match fragment.fragment_id {
                SUM_FRAGMENT => {
                    self.fragment_procedure
                        .insert(txn.txn_id, Procedure::SumAll);
                    self.counters.values().sum()
                }
                INCREMENT_FRAGMENT => {
                    self.fragment_procedure
                        .insert(txn.txn_id, Procedure::IncrementAll);
                    let args = CounterArgs::decode(&fragment.params)?;
                    self.add(&args.key, args.delta)
                }
                other => anyhow::bail!("unknown fragment {other}"),
            };
            outputs.push((fragment.output_dependency, encode_value(value)));
        }
        Ok(outputs)
    }

    fn complete_transaction(&mut self, txn_id: TxnId, rollback: bool) -> anyhow::Result<()> {
        if rollback {
            self.rollback();
        }
        self.undo.clear();
        let procedure = self
            .running
            .remove(&txn_id)
            .map(|running| running.procedure)
            .or_else(|| self.fragment_procedure.remove(&txn_id));
        self.fragment_procedure.remove(&txn_id);
        self.log
            .lock()
            .map_err(|_| anyhow::anyhow!("execution log lock poisoned"))?
            .push(ExecutedTxn {
                txn_id,
                procedure: procedure.map(|p| p.name().to_string()),
                rolled_back: rollback,
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(txn_id: u64) -> TxnMeta {
        TxnMeta {
            txn_id: TxnId(txn_id),
            initiator_id: 1,
            coordinator_id: 1,
            read_only: false,
            single_partition: true,
        }
    }

    fn start(engine: &mut CounterEngine, txn_id: u64, procedure: Procedure, delta: i64) -> ProcedureStep {
        let invocation = CounterArgs::new("k", delta)
            .invocation(procedure)
            .expect("invocation");
        engine
            .start_procedure(&meta(txn_id), &invocation)
            .expect("start")
    }

    #[test]
    fn rollback_restores_previous_values() {
        let log = ExecutionLog::default();
        let mut engine = CounterEngine::new(1, log.clone());
        start(&mut engine, 1, Procedure::Increment, 5);
        engine.complete_transaction(TxnId(1), false).expect("commit");

        match start(&mut engine, 2, Procedure::Abort, 10) {
            ProcedureStep::Complete(response) => {
                assert_eq!(response.status, ResponseStatus::UserAbort);
                assert!(response.sql_hash.is_some());
            }
            other => panic!("unexpected step {other:?}"),
        }
        engine.complete_transaction(TxnId(2), true).expect("rollback");
        assert_eq!(engine.counter("k"), 5);

        let log = log.lock().expect("log");
        assert_eq!(log.len(), 2);
        assert!(!log[0].rolled_back);
        assert!(log[1].rolled_back);
        assert_eq!(log[1].procedure.as_deref(), Some("abort"));
    }

    #[test]
    fn same_invocation_hashes_identically() {
        let mut first = CounterEngine::new(1, ExecutionLog::default());
        let mut second = CounterEngine::new(2, ExecutionLog::default());
        let a = start(&mut first, 1, Procedure::Read, 0);
        let b = start(&mut second, 1, Procedure::Read, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn multipartition_procedure_fans_out_and_sums() {
        let mut engine = CounterEngine::new(1, ExecutionLog::default());
        let mut txn = meta(3);
        txn.single_partition = false;
        let invocation = CounterArgs::new("k", 2)
            .invocation(Procedure::IncrementAll)
            .expect("invocation");
        let ProcedureStep::Dispatch(batches) = engine
            .start_procedure(&txn, &invocation)
            .expect("start")
        else {
            panic!("expected a dispatch");
        };
        let task = batches[0].distributed.clone().expect("distributed task");
        let outputs = engine
            .execute_fragment(&txn, &task, &DependencyResults::default())
            .expect("fragment");
        assert_eq!(decode_value(&outputs[0].1).expect("value"), 2);

        let mut inputs = DependencyResults::default();
        inputs
            .tables
            .insert(PARTITION_RESULT, vec![encode_value(2), encode_value(2)]);
        match engine.resume_procedure(&txn, &inputs).expect("resume") {
            ProcedureStep::Complete(response) => {
                assert_eq!(decode_value(&response.results[0]).expect("value"), 4);
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn procedure_names_round_trip() {
        for procedure in Procedure::ALL {
            assert_eq!(Procedure::from_name(procedure.name()), Some(procedure));
        }
        assert_eq!(Procedure::from_name("drop_table"), None);
    }
}
