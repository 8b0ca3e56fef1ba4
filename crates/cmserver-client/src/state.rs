//! Client lifecycle state.

use std::fmt;

use tokio::sync::watch;
use tracing::debug;

/// Lifecycle of one backend session.
///
/// ```text
/// Starting -> AwaitingHello -> Handshaking -> Ready -> ShuttingDown -> Terminated
///                  (any non-terminal state) -> Crashed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    /// Process spawned, pipe not yet connected.
    Starting,
    /// Pipe connected, waiting for the greeting.
    AwaitingHello,
    /// Handshake request in flight.
    Handshaking,
    /// Requests are accepted.
    Ready,
    /// `shutdown()` in progress.
    ShuttingDown,
    /// Process gone after a shutdown or a clean exit.
    Terminated,
    /// Process or transport failed unexpectedly.
    Crashed,
}

impl ServerState {
    /// Returns true for states that are never left.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Crashed)
    }

    /// Transition table.
    pub fn can_transition_to(self, next: ServerState) -> bool {
        use ServerState::*;

        match (self, next) {
            (Starting, AwaitingHello) | (AwaitingHello, Handshaking) | (Handshaking, Ready) => {
                true
            }
            (Starting | AwaitingHello | Handshaking | Ready, ShuttingDown) => true,
            (from, Terminated | Crashed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::AwaitingHello => "awaiting hello",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting down",
            Self::Terminated => "terminated",
            Self::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// The current [`ServerState`], observable through a watch channel.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<ServerState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(ServerState::Starting);
        Self { tx }
    }

    pub(crate) fn get(&self) -> ServerState {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.tx.subscribe()
    }

    /// Moves to `next` if the table allows it. Returns whether it did.
    pub(crate) fn transition(&self, next: ServerState) -> bool {
        let mut rejected_from = None;
        let changed = self.tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                rejected_from = Some(*state);
                false
            }
        });

        if changed {
            debug!(state = %next, "client state changed");
        } else if let Some(from) = rejected_from {
            debug!(from = %from, to = %next, "ignoring state transition");
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ServerState::*;

    const ALL: [ServerState; 7] = [
        Starting,
        AwaitingHello,
        Handshaking,
        Ready,
        ShuttingDown,
        Terminated,
        Crashed,
    ];

    #[test]
    fn happy_path_is_allowed() {
        let path = [
            Starting,
            AwaitingHello,
            Handshaking,
            Ready,
            ShuttingDown,
            Terminated,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn crash_reachable_from_every_live_state() {
        for state in ALL {
            assert_eq!(state.can_transition_to(Crashed), !state.is_terminal());
        }
    }

    #[test]
    fn terminal_states_are_final() {
        for from in [Terminated, Crashed] {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn no_skipping_the_handshake() {
        assert!(!AwaitingHello.can_transition_to(Ready));
        assert!(!Starting.can_transition_to(Ready));
        assert!(!ShuttingDown.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Handshaking));
    }

    #[test]
    fn cell_rejects_invalid_transition() {
        let cell = StateCell::new();
        let rx = cell.subscribe();

        assert!(!cell.transition(Ready));
        assert_eq!(cell.get(), Starting);

        assert!(cell.transition(AwaitingHello));
        assert_eq!(*rx.borrow(), AwaitingHello);

        assert!(cell.transition(Crashed));
        assert!(!cell.transition(Terminated));
        assert_eq!(cell.get(), Crashed);
    }
}
