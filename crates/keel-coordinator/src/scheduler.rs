use std::collections::{HashMap, VecDeque};

use log::{debug, info};

use crate::id::{ExecutionAttemptId, InstanceId, JobId};
use crate::protocol::TaskManagerGateway;

/// One unit of execution capacity on a registered instance.
/// Owned by the instance manager; lent to the scheduler's free pool, then
/// to an execution attempt, and returned when the attempt terminates.
#[derive(Clone)]
pub struct Slot {
    pub instance_id: InstanceId,
    pub slot_index: usize,
    pub host: String,
    pub gateway: TaskManagerGateway,
}

/// A slot request for one execution attempt, with locality preferences
/// ordered strongest first: co-location with a producer instance, then the
/// producer's host, then anywhere.
#[derive(Debug, Clone)]
pub struct SlotRequest {
    pub job_id: JobId,
    pub attempt_id: ExecutionAttemptId,
    pub preferred_instances: Vec<InstanceId>,
    pub preferred_hosts: Vec<String>,
}

pub enum SlotAllocation {
    Allocated(Slot),
    /// No capacity; the request was queued and will be fulfilled when a
    /// slot appears.
    Queued,
    /// No capacity and queued scheduling is disabled.
    Refused,
}

/// Pool of free execution slots contributed by registered instances.
/// Mutated only on the coordinator event loop.
pub struct Scheduler {
    free: Vec<Slot>,
    allocated: HashMap<ExecutionAttemptId, (JobId, Slot)>,
    queued: VecDeque<SlotRequest>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            free: Vec::new(),
            allocated: HashMap::new(),
            queued: VecDeque::new(),
        }
    }

    pub fn total_slots(&self) -> usize {
        self.free.len() + self.allocated.len()
    }

    pub fn available_slots(&self) -> usize {
        self.free.len()
    }

    /// Listener hook: a new instance contributed its slots.
    /// Returns queued requests that can now be fulfilled.
    pub fn instance_registered(&mut self, slots: Vec<Slot>) -> Vec<(SlotRequest, Slot)> {
        info!(
            "instance contributed {} slots, {} queued requests waiting",
            slots.len(),
            self.queued.len()
        );
        self.free.extend(slots);
        self.fulfill_queued()
    }

    /// Listener hook: an instance left the cluster. Its free slots are
    /// revoked and the attempts running on it are returned for failure.
    pub fn instance_unregistered(
        &mut self,
        instance_id: InstanceId,
    ) -> Vec<(JobId, ExecutionAttemptId)> {
        self.free.retain(|slot| slot.instance_id != instance_id);
        let affected: Vec<(JobId, ExecutionAttemptId)> = self
            .allocated
            .iter()
            .filter(|(_, (_, slot))| slot.instance_id == instance_id)
            .map(|(&attempt_id, &(job_id, _))| (job_id, attempt_id))
            .collect();
        for (_, attempt_id) in &affected {
            self.allocated.remove(attempt_id);
        }
        affected
    }

    /// Requests a slot honoring the locality preferences.
    pub fn request_slot(&mut self, request: SlotRequest, queued_allowed: bool) -> SlotAllocation {
        if let Some(index) = self.find_slot(&request) {
            let slot = self.free.swap_remove(index);
            self.allocated
                .insert(request.attempt_id, (request.job_id, slot.clone()));
            return SlotAllocation::Allocated(slot);
        }
        if queued_allowed {
            debug!("queuing slot request for attempt {}", request.attempt_id);
            self.queued.push_back(request);
            SlotAllocation::Queued
        } else {
            SlotAllocation::Refused
        }
    }

    fn find_slot(&self, request: &SlotRequest) -> Option<usize> {
        if self.free.is_empty() {
            return None;
        }
        self.free
            .iter()
            .position(|slot| request.preferred_instances.contains(&slot.instance_id))
            .or_else(|| {
                self.free
                    .iter()
                    .position(|slot| request.preferred_hosts.contains(&slot.host))
            })
            .or(Some(0))
    }

    /// Returns an attempt's slot to the free pool.
    /// Returns queued requests that can now be fulfilled.
    pub fn release(&mut self, attempt_id: ExecutionAttemptId) -> Vec<(SlotRequest, Slot)> {
        match self.allocated.remove(&attempt_id) {
            Some((_, slot)) => {
                self.free.push(slot);
                self.fulfill_queued()
            }
            None => vec![],
        }
    }

    /// Returns a slot whose allocation was abandoned before deployment.
    pub fn return_slot(&mut self, attempt_id: ExecutionAttemptId, slot: Slot) -> Vec<(SlotRequest, Slot)> {
        self.allocated.remove(&attempt_id);
        self.free.push(slot);
        self.fulfill_queued()
    }

    /// Drops queued requests belonging to a job that is going away.
    pub fn cancel_queued_requests(&mut self, job_id: JobId) {
        self.queued.retain(|request| request.job_id != job_id);
    }

    pub fn allocated_slot(&self, attempt_id: ExecutionAttemptId) -> Option<&Slot> {
        self.allocated.get(&attempt_id).map(|(_, slot)| slot)
    }

    pub fn shutdown(&mut self) {
        self.free.clear();
        self.allocated.clear();
        self.queued.clear();
    }

    fn fulfill_queued(&mut self) -> Vec<(SlotRequest, Slot)> {
        let mut fulfilled = vec![];
        while !self.free.is_empty() {
            let Some(request) = self.queued.pop_front() else {
                break;
            };
            let index = match self.find_slot(&request) {
                Some(index) => index,
                None => break,
            };
            let slot = self.free.swap_remove(index);
            self.allocated
                .insert(request.attempt_id, (request.job_id, slot.clone()));
            fulfilled.push((request, slot));
        }
        fulfilled
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn slots(instance_id: u64, host: &str, count: usize) -> Vec<Slot> {
        let (tx, _rx) = mpsc::unbounded_channel();
        (0..count)
            .map(|slot_index| Slot {
                instance_id: InstanceId::from(instance_id),
                slot_index,
                host: host.to_string(),
                gateway: tx.clone(),
            })
            .collect()
    }

    fn request(attempt_id: ExecutionAttemptId) -> SlotRequest {
        SlotRequest {
            job_id: JobId::random(),
            attempt_id,
            preferred_instances: vec![],
            preferred_hosts: vec![],
        }
    }

    #[tokio::test]
    async fn test_slot_accounting() {
        let mut scheduler = Scheduler::new();
        assert!(scheduler.instance_registered(slots(1, "a", 2)).is_empty());
        assert_eq!(scheduler.total_slots(), 2);
        assert_eq!(scheduler.available_slots(), 2);

        let attempt = ExecutionAttemptId::random();
        let allocation = scheduler.request_slot(request(attempt), false);
        assert!(matches!(allocation, SlotAllocation::Allocated(_)));
        assert_eq!(scheduler.available_slots(), 1);
        assert_eq!(scheduler.total_slots(), 2);

        assert!(scheduler.release(attempt).is_empty());
        assert_eq!(scheduler.available_slots(), 2);
    }

    #[tokio::test]
    async fn test_locality_preference_order() {
        let mut scheduler = Scheduler::new();
        scheduler.instance_registered(slots(1, "alpha", 1));
        scheduler.instance_registered(slots(2, "beta", 1));
        scheduler.instance_registered(slots(3, "beta", 1));

        // Instance preference wins over host preference.
        let mut preferred = request(ExecutionAttemptId::random());
        preferred.preferred_instances = vec![InstanceId::from(3)];
        preferred.preferred_hosts = vec!["alpha".to_string()];
        match scheduler.request_slot(preferred, false) {
            SlotAllocation::Allocated(slot) => assert_eq!(slot.instance_id, InstanceId::from(3)),
            _ => panic!("expected an allocated slot"),
        }

        // Host preference is used when no preferred instance has capacity.
        let mut by_host = request(ExecutionAttemptId::random());
        by_host.preferred_instances = vec![InstanceId::from(3)];
        by_host.preferred_hosts = vec!["beta".to_string()];
        match scheduler.request_slot(by_host, false) {
            SlotAllocation::Allocated(slot) => assert_eq!(slot.host, "beta"),
            _ => panic!("expected an allocated slot"),
        }
    }

    #[tokio::test]
    async fn test_queued_request_fulfilled_on_release() {
        let mut scheduler = Scheduler::new();
        scheduler.instance_registered(slots(1, "a", 1));
        let first = ExecutionAttemptId::random();
        let second = ExecutionAttemptId::random();
        assert!(matches!(
            scheduler.request_slot(request(first), true),
            SlotAllocation::Allocated(_)
        ));
        assert!(matches!(
            scheduler.request_slot(request(second), true),
            SlotAllocation::Queued
        ));
        assert!(matches!(
            scheduler.request_slot(request(ExecutionAttemptId::random()), false),
            SlotAllocation::Refused
        ));

        let fulfilled = scheduler.release(first);
        assert_eq!(fulfilled.len(), 1);
        assert_eq!(fulfilled[0].0.attempt_id, second);
        assert_eq!(scheduler.available_slots(), 0);
    }

    #[tokio::test]
    async fn test_instance_unregistered_returns_running_attempts() {
        let mut scheduler = Scheduler::new();
        scheduler.instance_registered(slots(1, "a", 2));
        let attempt = ExecutionAttemptId::random();
        let job_request = request(attempt);
        let job_id = job_request.job_id;
        scheduler.request_slot(job_request, false);
        let affected = scheduler.instance_unregistered(InstanceId::from(1));
        assert_eq!(affected, vec![(job_id, attempt)]);
        assert_eq!(scheduler.total_slots(), 0);
        // Releasing the failed attempt later is a no-op.
        assert!(scheduler.release(attempt).is_empty());
    }
}
