use std::time::Duration;

/// Top-level tunables of the RPC core.
#[derive(Clone)]
pub struct RpcConfig {
    pub timeout: TimeoutSetting,
    /// Upper bound of concurrently running request handlers per skeleton
    pub pool_size: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self { timeout: TimeoutSetting::default(), pool_size: 128 }
    }
}

#[derive(Clone, Copy)]
pub struct TimeoutSetting {
    /// Default deadline of a call, measured from entering `call` until the
    /// response header has been received. The response body is not timed.
    pub rpc_timeout: Duration,
    /// Socket connect timeout used by the stub pool
    pub connect_timeout: Duration,
    /// Idle time after which an unreferenced pooled stub is dropped
    pub expiration: Duration,
}

impl Default for TimeoutSetting {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(5),
            expiration: Duration::from_secs(60),
        }
    }
}
