//! Local link state machine.
//!
//! ```text
//! Disconnected ──begin_connect──► Connecting ──opened──► Open
//!       ▲                            ▲   │                │
//!       │                          retry lost            lost
//!      stop                          │   ▼                │
//!       └──────────────────────── Reconnecting ◄──────────┘
//! ```
//!
//! Every restart or teardown bumps the generation. Work spawned under an
//! older generation (claims, dials, channel readers, retry timers) is
//! discarded when it completes.

/// State of the local peer's link to the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Open,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct Liveness {
    state: LinkState,
    generation: u64,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            state: LinkState::Disconnected,
            generation: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether work tagged with `generation` is still wanted.
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Start the first connection. Returns the new generation.
    pub fn begin_connect(&mut self) -> Option<u64> {
        match self.state {
            LinkState::Disconnected => Some(self.restart()),
            _ => None,
        }
    }

    /// Restart from `Reconnecting`, either after the delay or on resume.
    pub fn retry(&mut self) -> Option<u64> {
        match self.state {
            LinkState::Reconnecting => Some(self.restart()),
            _ => None,
        }
    }

    pub fn opened(&mut self) -> bool {
        if self.state != LinkState::Connecting {
            return false;
        }
        self.state = LinkState::Open;
        true
    }

    /// Transport failure. Returns the new generation.
    pub fn lost(&mut self) -> Option<u64> {
        match self.state {
            LinkState::Connecting | LinkState::Open => {
                self.state = LinkState::Reconnecting;
                self.generation += 1;
                Some(self.generation)
            }
            _ => None,
        }
    }

    /// Final teardown.
    pub fn stop(&mut self) {
        self.state = LinkState::Disconnected;
        self.generation += 1;
    }

    fn restart(&mut self) -> u64 {
        self.state = LinkState::Connecting;
        self.generation += 1;
        self.generation
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}
