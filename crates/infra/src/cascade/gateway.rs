use custos_contract::Contract;
use custos_opportunity::Opportunity;
use custos_organization::Organization;

use crate::command_dispatcher::CommandDispatcher;
use crate::event_store::EventStore;

use super::{CascadeError, CommandGateway, OutboundCommand};

/// Routes follow-up commands to their aggregates through the command dispatcher.
///
/// Runs in-process, so a follow-up is appended (and published) before the triggering
/// delivery is acknowledged.
#[derive(Debug, Clone)]
pub struct DispatchingGateway<S> {
    dispatcher: CommandDispatcher<S>,
}

impl<S> DispatchingGateway<S> {
    pub fn new(dispatcher: CommandDispatcher<S>) -> Self {
        Self { dispatcher }
    }
}

impl<S: EventStore> CommandGateway for DispatchingGateway<S> {
    fn send(&self, command: OutboundCommand) -> Result<(), CascadeError> {
        match command {
            OutboundCommand::Organization(c) => self.dispatcher.dispatch(c, Organization::empty)?,
            OutboundCommand::Contract(c) => self.dispatcher.dispatch(c, Contract::empty)?,
            OutboundCommand::Opportunity(c) => self.dispatcher.dispatch(c, Opportunity::empty)?,
        };
        Ok(())
    }
}

#[cfg(test)]
pub(crate) use recording::RecordingGateway;
