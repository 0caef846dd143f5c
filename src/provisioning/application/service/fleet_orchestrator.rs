//! Runs one [`LifecycleDriver`] per node and aggregates their outcomes.
//!
//! Drivers run as concurrent tasks. At most `concurrency` of them are in the
//! provisioning half at once; permits are handed out masters first. Workers
//! only resolve their facts once every master has settled, either by
//! reaching the guest agent or by failing, so fact aggregation is ordered
//! even though VM creation is not.

use crate::{
    core::domain::{
        error::{FleetError, FleetResult, NodeFailure},
        hypervisor::Hypervisor,
        model::{
            node_facts::NodeFacts,
            node_spec::{NodeRole, NodeSpec},
            node_state::NodePhase,
        },
        value_object::{NodeName, VmId},
    },
    provisioning::application::service::lifecycle_driver::{DriverSettings, LifecycleDriver},
};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Final state of one node after a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOutcome {
    pub name: NodeName,
    pub role: NodeRole,
    pub vm_id: Option<VmId>,
    pub phase: NodePhase,
    pub ip: Option<IpAddr>,
    pub ansible_user: String,
    pub failure: Option<NodeFailure>,
}

/// Everything a run produced, in allocation order (masters first).
#[derive(Debug, Clone)]
pub struct FleetReport {
    pub planned: usize,
    pub outcomes: Vec<NodeOutcome>,
    pub facts: Vec<NodeFacts>,
    pub failures: Vec<NodeFailure>,
}

impl FleetReport {
    /// Masters that reached `Ready`.
    #[must_use]
    pub fn surviving_masters(&self) -> usize {
        self.facts
            .iter()
            .filter(|facts| facts.role == NodeRole::Master)
            .count()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Fails when not a single master reached `Ready`.
    ///
    /// # Errors
    /// `FleetError::NoSurvivingMasters` carrying every node failure.
    pub fn ensure_masters(&self) -> FleetResult<()> {
        if self.surviving_masters() == 0 {
            return Err(FleetError::NoSurvivingMasters {
                failures: self.failures.clone(),
            });
        }
        Ok(())
    }

    /// The partial-failure error for the caller to judge, when any node failed.
    #[must_use]
    pub fn partial_failure(&self) -> Option<FleetError> {
        (!self.failures.is_empty()).then(|| FleetError::PartialFleetFailure {
            planned: self.planned,
            failures: self.failures.clone(),
        })
    }
}

pub struct FleetOrchestrator {
    hypervisor: Arc<dyn Hypervisor>,
    settings: Arc<DriverSettings>,
    concurrency: usize,
}

/// Counts masters that have settled. Signals exactly once, on drop at the
/// latest, so a panicking or cancelled master never blocks the workers.
struct MasterSettled(Option<Arc<watch::Sender<usize>>>);

impl MasterSettled {
    fn signal(&mut self) {
        if let Some(settled) = self.0.take() {
            settled.send_modify(|count| *count += 1);
        }
    }
}

impl Drop for MasterSettled {
    fn drop(&mut self) {
        self.signal();
    }
}

enum Gate {
    Master(MasterSettled),
    Worker {
        settled: watch::Receiver<usize>,
        masters: usize,
    },
}

struct NodeRun {
    driver: LifecycleDriver,
    result: Result<NodeFacts, NodeFailure>,
}

impl FleetOrchestrator {
    /// `concurrency` caps how many nodes are provisioned at once; zero is treated as one.
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        settings: Arc<DriverSettings>,
        concurrency: usize,
    ) -> Self {
        Self {
            hypervisor,
            settings,
            concurrency: concurrency.max(1),
        }
    }

    /// Provisions every node in `specs` and reports each outcome.
    ///
    /// A failed node never aborts its siblings. Cancelling `cancel` stops
    /// in-flight hypervisor calls and polling; VMs are left as they are.
    pub async fn provision(&self, specs: Vec<NodeSpec>, cancel: &CancellationToken) -> FleetReport {
        let planned = specs.len();
        let mut specs = specs;
        // Stable, so allocation order within a role is kept.
        specs.sort_by_key(|spec| spec.role);

        let masters = specs
            .iter()
            .filter(|spec| spec.role == NodeRole::Master)
            .count();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let (settled_tx, settled_rx) = watch::channel(0usize);
        let settled_tx = Arc::new(settled_tx);
        info!(planned, masters, concurrency = self.concurrency, "provisioning fleet");

        let mut handles = Vec::with_capacity(planned);
        for spec in specs {
            // Acquired here rather than inside the task so masters queue first.
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let gate = match spec.role {
                NodeRole::Master => Gate::Master(MasterSettled(Some(Arc::clone(&settled_tx)))),
                NodeRole::Worker => Gate::Worker {
                    settled: settled_rx.clone(),
                    masters,
                },
            };
            let driver = LifecycleDriver::new(
                Arc::clone(&self.hypervisor),
                Arc::clone(&self.settings),
                spec.clone(),
            );
            let cancel = cancel.child_token();
            let handle = tokio::spawn(run_node(driver, gate, permit, cancel));
            handles.push((spec, handle));
        }

        let mut report = FleetReport {
            planned,
            outcomes: Vec::with_capacity(planned),
            facts: Vec::with_capacity(planned),
            failures: Vec::new(),
        };
        for (spec, handle) in handles {
            match handle.await {
                Ok(run) => record(&mut report, run),
                Err(join_error) => {
                    error!(vm = %spec.name, error = %join_error, "driver task aborted");
                    let failure = NodeFailure {
                        name: spec.name.to_string(),
                        role: spec.role,
                        phase: NodePhase::Planned,
                        kind: "Aborted",
                        message: join_error.to_string(),
                    };
                    report.outcomes.push(NodeOutcome {
                        name: spec.name.clone(),
                        role: spec.role,
                        vm_id: spec.vm_id,
                        phase: NodePhase::Failed,
                        ip: None,
                        ansible_user: self.settings.ssh_user.clone(),
                        failure: Some(failure.clone()),
                    });
                    report.failures.push(failure);
                }
            }
        }

        if report.is_complete() {
            info!(ready = report.facts.len(), "fleet ready");
        } else {
            warn!(
                ready = report.facts.len(),
                failed = report.failures.len(),
                surviving_masters = report.surviving_masters(),
                "fleet partially provisioned"
            );
        }
        report
    }
}

async fn run_node(
    mut driver: LifecycleDriver,
    gate: Gate,
    permit: Option<OwnedSemaphorePermit>,
    cancel: CancellationToken,
) -> NodeRun {
    let result = match permit {
        Some(permit) => tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            result = drive(&mut driver, gate, permit) => Some(result),
        },
        None => None,
    };
    let result = result.unwrap_or_else(|| Err(driver.fail(FleetError::Cancelled)));
    NodeRun { driver, result }
}

async fn drive(
    driver: &mut LifecycleDriver,
    mut gate: Gate,
    permit: OwnedSemaphorePermit,
) -> Result<NodeFacts, NodeFailure> {
    let provisioned = driver.provision().await;
    drop(permit);

    match &mut gate {
        Gate::Master(settled) => settled.signal(),
        Gate::Worker { settled, masters } => {
            if provisioned.is_ok() {
                let masters = *masters;
                // The sender outlives every task; an error only means it is gone.
                let _ = settled.wait_for(|count| *count >= masters).await;
            }
        }
    }
    provisioned?;
    driver.finalize().await
}

fn record(report: &mut FleetReport, run: NodeRun) {
    let NodeRun { driver, result } = run;
    let spec = driver.spec();
    let state = driver.state();
    let (failure, ip) = match result {
        Ok(facts) => {
            let ip = facts.ip;
            report.facts.push(facts);
            (None, Some(ip))
        }
        Err(failure) => {
            report.failures.push(failure.clone());
            (Some(failure), None)
        }
    };
    report.outcomes.push(NodeOutcome {
        name: spec.name.clone(),
        role: spec.role,
        vm_id: state.handle().map(|handle| handle.vmid).or(spec.vm_id),
        phase: state.phase(),
        ip,
        ansible_user: state.ssh_user().to_string(),
        failure,
    });
}
