use std::collections::HashMap;
use std::time::Duration;

use log::{info, warn};
use tokio::time::Instant;

use crate::error::{CoordinationError, CoordinationResult};
use crate::id::{IdGenerator, InstanceId};
use crate::protocol::{HardwareDescription, InstanceConnectionInfo, TaskManagerGateway};
use crate::scheduler::Slot;

/// A registered task manager process.
pub struct Instance {
    pub instance_id: InstanceId,
    pub connection: InstanceConnectionInfo,
    pub hardware: HardwareDescription,
    pub slot_count: usize,
    pub gateway: TaskManagerGateway,
    pub last_heartbeat: Instant,
    pub last_metrics: Option<Vec<u8>>,
}

impl Instance {
    /// The slots this instance contributes to the scheduler's free pool.
    pub fn slots(&self) -> Vec<Slot> {
        (0..self.slot_count)
            .map(|slot_index| Slot {
                instance_id: self.instance_id,
                slot_index,
                host: self.connection.host.clone(),
                gateway: self.gateway.clone(),
            })
            .collect()
    }
}

/// Registry of live task managers, keyed by the instance id assigned at
/// registration. Owned by the coordinator and mutated only on the event
/// loop; slot capacity is lent to the scheduler through the caller.
pub struct InstanceManager {
    instances: HashMap<InstanceId, Instance>,
    by_connection: HashMap<InstanceConnectionInfo, InstanceId>,
    id_generator: IdGenerator<InstanceId>,
    heartbeat_timeout: Duration,
    total_registered_slots: usize,
}

impl InstanceManager {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            instances: HashMap::new(),
            by_connection: HashMap::new(),
            id_generator: IdGenerator::new(),
            heartbeat_timeout,
            total_registered_slots: 0,
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Returns the instance id under which the connection is already
    /// registered, if any.
    pub fn registered_instance(&self, connection: &InstanceConnectionInfo) -> Option<InstanceId> {
        self.by_connection.get(connection).copied()
    }

    /// Registers a task manager. Registering the same connection twice is an
    /// error; the caller is expected to have answered duplicates with the
    /// existing instance id beforehand.
    pub fn register(
        &mut self,
        connection: InstanceConnectionInfo,
        hardware: HardwareDescription,
        slot_count: usize,
        gateway: TaskManagerGateway,
    ) -> CoordinationResult<InstanceId> {
        if slot_count == 0 {
            return Err(CoordinationError::invalid(format!(
                "task manager at {connection} offers no slots"
            )));
        }
        if let Some(existing) = self.by_connection.get(&connection) {
            return Err(CoordinationError::invalid(format!(
                "task manager at {connection} is already registered as instance {existing}"
            )));
        }
        let instance_id = self.id_generator.next()?;
        let instance = Instance {
            instance_id,
            connection: connection.clone(),
            hardware,
            slot_count,
            gateway,
            last_heartbeat: Instant::now(),
            last_metrics: None,
        };
        info!("registered task manager at {connection} as instance {instance_id} with {slot_count} slots");
        self.by_connection.insert(connection, instance_id);
        self.instances.insert(instance_id, instance);
        self.total_registered_slots += slot_count;
        Ok(instance_id)
    }

    /// Removes an instance from the registry and returns it so the caller
    /// can revoke its slots from the scheduler.
    pub fn unregister(&mut self, instance_id: InstanceId) -> Option<Instance> {
        let instance = self.instances.remove(&instance_id)?;
        self.by_connection.remove(&instance.connection);
        self.total_registered_slots -= instance.slot_count;
        info!(
            "unregistered instance {instance_id} at {}",
            instance.connection
        );
        Some(instance)
    }

    /// Records a heartbeat. Returns the heartbeat instant when the instance
    /// is known, so the caller can schedule the liveness probe.
    pub fn record_heartbeat(
        &mut self,
        instance_id: InstanceId,
        metrics: Vec<u8>,
    ) -> Option<Instant> {
        let Some(instance) = self.instances.get_mut(&instance_id) else {
            warn!("heartbeat from unknown instance {instance_id}");
            return None;
        };
        instance.last_heartbeat = Instant::now();
        instance.last_metrics = Some(metrics);
        Some(instance.last_heartbeat)
    }

    /// Whether the instance has not sent a heartbeat since the watermark.
    pub fn is_heartbeat_stale(&self, instance_id: InstanceId, watermark: Instant) -> bool {
        self.instances
            .get(&instance_id)
            .is_some_and(|i| i.last_heartbeat <= watermark)
    }

    pub fn instance(&self, instance_id: InstanceId) -> Option<&Instance> {
        self.instances.get(&instance_id)
    }

    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    pub fn count_registered(&self) -> usize {
        self.instances.len()
    }

    pub fn total_slots(&self) -> usize {
        self.total_registered_slots
    }

    /// Drains the registry, returning all instances for disconnect fan-out.
    pub fn drain(&mut self) -> Vec<Instance> {
        self.by_connection.clear();
        self.total_registered_slots = 0;
        self.instances.drain().map(|(_, instance)| instance).collect()
    }
}
