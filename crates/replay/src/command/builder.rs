//! Per-work-unit outbox and the queue of commands awaiting their echo

use std::collections::VecDeque;

use super::Command;
use crate::history::EventAttributes;
use crate::operation::OperationId;

/// Result of matching a historical echo event
#[derive(Debug, Clone, PartialEq)]
pub enum EchoMatch {
    /// The event is the echo of the oldest outstanding command
    Matched(Command),

    /// The event does not line up with the oldest outstanding command
    Mismatch { expected: Option<Command> },
}

/// Collects the commands of one work unit
///
/// Commands are pushed while fibers run. At the end of a round the outbox
/// is flushed: the commands move to the echo queue, where each must be
/// matched, in order, by the event the service records for it.
#[derive(Debug, Clone, Default)]
pub struct CommandBuilder {
    outbox: Vec<Command>,
    awaiting_echo: VecDeque<Command>,
}

impl CommandBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        self.outbox.push(command);
    }

    /// Withdraw the unsent command that initiates `operation_id`
    ///
    /// Returns false if that command already left the outbox.
    pub fn retract(&mut self, operation_id: OperationId) -> bool {
        let position = self
            .outbox
            .iter()
            .position(|c| c.initiates_operation() && c.operation_id() == Some(operation_id));

        match position {
            Some(index) => {
                self.outbox.remove(index);
                true
            }
            None => false,
        }
    }

    /// Commands produced so far in this work unit
    pub fn outbox(&self) -> &[Command] {
        &self.outbox
    }

    /// Close the work unit, queueing its commands for echo matching
    pub fn flush(&mut self) -> Vec<Command> {
        let commands = std::mem::take(&mut self.outbox);
        self.awaiting_echo.extend(commands.iter().cloned());
        commands
    }

    /// Match an echo event against the oldest outstanding command
    ///
    /// The command is consumed only on a match.
    pub fn match_echo(&mut self, event: &EventAttributes) -> EchoMatch {
        match self.awaiting_echo.front() {
            Some(command) if command.matches_echo(event) => match self.awaiting_echo.pop_front() {
                Some(command) => EchoMatch::Matched(command),
                None => EchoMatch::Mismatch { expected: None },
            },
            front => EchoMatch::Mismatch {
                expected: front.cloned(),
            },
        }
    }

    /// Commands sent but not yet echoed
    pub fn pending_echoes(&self) -> usize {
        self.awaiting_echo.len()
    }

    /// The oldest command still waiting for its echo
    pub fn next_expected(&self) -> Option<&Command> {
        self.awaiting_echo.front()
    }

    /// Whether any queued or unsent command refers to `operation_id`
    pub fn has_pending(&self, operation_id: OperationId) -> bool {
        self.outbox
            .iter()
            .chain(self.awaiting_echo.iter())
            .any(|c| c.operation_id() == Some(operation_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn timer(id: u64) -> Command {
        Command::StartTimer {
            operation_id: OperationId(id),
            duration: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_flush_moves_outbox_to_echo_queue() {
        let mut builder = CommandBuilder::new();
        builder.push(timer(1));
        builder.push(timer(2));

        let sent = builder.flush();
        assert_eq!(sent.len(), 2);
        assert!(builder.outbox().is_empty());
        assert_eq!(builder.pending_echoes(), 2);
        assert_eq!(builder.next_expected(), Some(&timer(1)));
    }

    #[test]
    fn test_echoes_match_in_order() {
        let mut builder = CommandBuilder::new();
        builder.push(timer(1));
        builder.push(timer(2));
        builder.flush();

        // Out of order
        let second = timer(2).echo();
        assert_eq!(
            builder.match_echo(&second),
            EchoMatch::Mismatch {
                expected: Some(timer(1))
            }
        );
        assert_eq!(builder.pending_echoes(), 2);

        assert_eq!(builder.match_echo(&timer(1).echo()), EchoMatch::Matched(timer(1)));
        assert_eq!(builder.match_echo(&second), EchoMatch::Matched(timer(2)));
        assert_eq!(
            builder.match_echo(&second),
            EchoMatch::Mismatch { expected: None }
        );
    }

    #[test]
    fn test_retract_only_unsent_initiating_command() {
        let mut builder = CommandBuilder::new();
        builder.push(timer(1));
        builder.flush();
        builder.push(timer(2));
        builder.push(Command::CancelTimer {
            operation_id: OperationId(3),
        });

        assert!(!builder.retract(OperationId(1)));
        assert!(!builder.retract(OperationId(3)));
        assert!(builder.retract(OperationId(2)));
        assert_eq!(builder.outbox().len(), 1);
    }

    #[test]
    fn test_has_pending() {
        let mut builder = CommandBuilder::new();
        builder.push(timer(1));
        assert!(builder.has_pending(OperationId(1)));
        builder.flush();
        assert!(builder.has_pending(OperationId(1)));
        builder.match_echo(&timer(1).echo());
        assert!(!builder.has_pending(OperationId(1)));
    }
}
