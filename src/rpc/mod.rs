//! RPC surface of the platform service.
//!
//! Clients reach the daemon over a Unix stream socket. The caller's pid,
//! uid and user name come from the socket's peer credentials, so no method
//! takes an identity argument.

pub mod server;

pub use server::{bind_socket, serve_rpc};

use crate::access_lists::Access;
use crate::error::ServiceResult;
use crate::platform_io::{BatchRequest, ControlInfo, Domain, SignalInfo};

/// Service exposed by the daemon to its clients.
#[tarpc::service]
pub trait PlatformRpc {
    /// Opens a session for the caller or adds a reference to it.
    async fn open_session() -> ServiceResult<()>;

    /// Drops one reference to the caller's session.
    async fn close_session() -> ServiceResult<()>;

    /// Signals and controls the caller's user may access.
    async fn get_user_access() -> ServiceResult<Access>;

    /// Every signal and control the platform provides.
    async fn get_all_access() -> Access;

    async fn get_group_access(group: String) -> ServiceResult<Access>;

    /// Root only.
    async fn set_group_access(
        group: String,
        signals: Vec<String>,
        controls: Vec<String>,
    ) -> ServiceResult<()>;

    /// Root only.
    async fn set_group_access_signals(group: String, signals: Vec<String>) -> ServiceResult<()>;

    /// Root only.
    async fn set_group_access_controls(group: String, controls: Vec<String>) -> ServiceResult<()>;

    async fn get_signal_info(names: Vec<String>) -> ServiceResult<Vec<SignalInfo>>;

    async fn get_control_info(names: Vec<String>) -> ServiceResult<Vec<ControlInfo>>;

    /// NaN when the caller has no session or the signal is not allowed.
    async fn read_signal(name: String, domain: Domain, domain_idx: u32) -> ServiceResult<f64>;

    async fn write_control(
        name: String,
        domain: Domain,
        domain_idx: u32,
        value: f64,
    ) -> ServiceResult<()>;

    /// Returns `(server_pid, server_key)` of the new batch server.
    async fn start_batch(
        signal_config: Vec<BatchRequest>,
        control_config: Vec<BatchRequest>,
    ) -> ServiceResult<(u32, String)>;

    async fn stop_batch(server_pid: u32) -> ServiceResult<()>;

    async fn restore_control() -> ServiceResult<()>;

    async fn start_profile(profile_name: String) -> ServiceResult<()>;

    async fn stop_profile(region_names: Vec<String>) -> ServiceResult<()>;

    async fn get_profile_pids(profile_name: String) -> ServiceResult<Option<Vec<u32>>>;

    async fn pop_profile_region_names(profile_name: String) -> ServiceResult<Vec<String>>;

    /// Root only. Ends the current write session and blocks new ones.
    async fn lock_control() -> ServiceResult<()>;

    /// Root only.
    async fn unlock_control() -> ServiceResult<()>;
}

#[cfg(test)]
#[path = "tests/rpc_tests.rs"]
mod rpc_tests;
