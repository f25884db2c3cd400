/// Lifecycle signal broadcast to the background tasks over a `watch` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Running,
    /// Finish queued work (force-flush semantics) and exit.
    Drain,
    /// Exit immediately; queued work is abandoned as if the process died.
    Halt,
}
