//! Control-connection and topology monitoring events: heartbeat and
//! cluster-membership change reporting for the control connection.

use crate::host::Address;

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct ControlConnectionOpenedEvent {
    pub address: Address,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct ControlConnectionClosedEvent {
    pub address: Address,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct ControlConnectionFailedEvent {
    pub address: Address,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct HostAddedEvent {
    pub address: Address,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct HostRemovedEvent {
    pub address: Address,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct HostUpEvent {
    pub address: Address,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct HostDownEvent {
    pub address: Address,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct SchemaAgreementReachedEvent {
    pub schema_version: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct SchemaAgreementTimedOutEvent;

/// Implemented by user-supplied topology monitors.
pub trait TopologyEventHandler: Send + Sync {
    fn handle_control_connection_opened_event(&self, _event: ControlConnectionOpenedEvent) {}
    fn handle_control_connection_closed_event(&self, _event: ControlConnectionClosedEvent) {}
    fn handle_control_connection_failed_event(&self, _event: ControlConnectionFailedEvent) {}
    fn handle_host_added_event(&self, _event: HostAddedEvent) {}
    fn handle_host_removed_event(&self, _event: HostRemovedEvent) {}
    fn handle_host_up_event(&self, _event: HostUpEvent) {}
    fn handle_host_down_event(&self, _event: HostDownEvent) {}
    fn handle_schema_agreement_reached_event(&self, _event: SchemaAgreementReachedEvent) {}
    fn handle_schema_agreement_timed_out_event(&self, _event: SchemaAgreementTimedOutEvent) {}
}
