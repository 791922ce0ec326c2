/// Reconnection [`Supervisor`](reconnect::Supervisor), [`Backoff`](reconnect::Backoff) and
/// [`FeedStatus`](reconnect::FeedStatus).
pub mod reconnect;

/// Heartbeat [`TimeoutStream`](timeout::TimeoutStream) used to detect stalled connections.
pub mod timeout;
