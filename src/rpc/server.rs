//! Unix-socket server for [`PlatformRpc`].

use super::PlatformRpc;
use crate::access_lists::{Access, AccountDb};
use crate::daemon_log::{daemon_log, service_warning};
use crate::error::{ServiceError, ServiceResult};
use crate::platform_io::{BatchRequest, ControlInfo, Domain, SignalInfo};
use crate::platform_service::PlatformService;
use anyhow::Context;
use futures::StreamExt;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Bincode;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, Mutex};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Any local user may connect; authorization happens per call.
const SOCKET_MODE: u32 = 0o666;

/// Identity of the process on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub pid: u32,
    pub uid: u32,
    pub user: String,
}

impl Caller {
    /// Reads `SO_PEERCRED` of the stream and resolves the user name.
    pub fn from_stream(stream: &UnixStream, accounts: &dyn AccountDb) -> anyhow::Result<Self> {
        let cred = stream
            .peer_cred()
            .context("Failed to read peer credentials")?;
        let pid = cred.pid().context("Peer credentials carry no PID")?;
        let pid = u32::try_from(pid).with_context(|| format!("Invalid peer PID: {}", pid))?;
        let uid = cred.uid();
        let user = accounts
            .user_name(uid)?
            .with_context(|| format!("No user name for uid {}", uid))?;
        Ok(Self { pid, uid, user })
    }
}

/// Per-connection server; all connections share one service.
#[derive(Clone)]
pub struct PlatformServer {
    service: Arc<Mutex<PlatformService>>,
    caller: Caller,
}

impl PlatformServer {
    pub fn new(service: Arc<Mutex<PlatformService>>, caller: Caller) -> Self {
        Self { service, caller }
    }

    fn require_root(&self, operation: &str) -> ServiceResult<()> {
        if self.caller.uid == 0 {
            return Ok(());
        }
        service_warning(&format!(
            "Operation {} denied for user {} (PID {})",
            operation, self.caller.user, self.caller.pid
        ));
        Err(ServiceError::NotPermitted {
            operation: operation.to_string(),
        })
    }
}

impl PlatformRpc for PlatformServer {
    async fn open_session(self, _: tarpc::context::Context) -> ServiceResult<()> {
        self.service
            .lock()
            .await
            .open_session(&self.caller.user, self.caller.pid)
    }

    async fn close_session(self, _: tarpc::context::Context) -> ServiceResult<()> {
        self.service.lock().await.close_session(self.caller.pid)
    }

    async fn get_user_access(self, _: tarpc::context::Context) -> ServiceResult<Access> {
        self.service.lock().await.get_user_access(&self.caller.user)
    }

    async fn get_all_access(self, _: tarpc::context::Context) -> Access {
        self.service.lock().await.get_all_access()
    }

    async fn get_group_access(
        self,
        _: tarpc::context::Context,
        group: String,
    ) -> ServiceResult<Access> {
        self.service.lock().await.get_group_access(&group)
    }

    async fn set_group_access(
        self,
        _: tarpc::context::Context,
        group: String,
        signals: Vec<String>,
        controls: Vec<String>,
    ) -> ServiceResult<()> {
        self.require_root("set_group_access")?;
        self.service
            .lock()
            .await
            .set_group_access(&group, &signals, &controls)
    }

    async fn set_group_access_signals(
        self,
        _: tarpc::context::Context,
        group: String,
        signals: Vec<String>,
    ) -> ServiceResult<()> {
        self.require_root("set_group_access_signals")?;
        self.service
            .lock()
            .await
            .set_group_access_signals(&group, &signals)
    }

    async fn set_group_access_controls(
        self,
        _: tarpc::context::Context,
        group: String,
        controls: Vec<String>,
    ) -> ServiceResult<()> {
        self.require_root("set_group_access_controls")?;
        self.service
            .lock()
            .await
            .set_group_access_controls(&group, &controls)
    }

    async fn get_signal_info(
        self,
        _: tarpc::context::Context,
        names: Vec<String>,
    ) -> ServiceResult<Vec<SignalInfo>> {
        self.service.lock().await.get_signal_info(&names)
    }

    async fn get_control_info(
        self,
        _: tarpc::context::Context,
        names: Vec<String>,
    ) -> ServiceResult<Vec<ControlInfo>> {
        self.service.lock().await.get_control_info(&names)
    }

    async fn read_signal(
        self,
        _: tarpc::context::Context,
        name: String,
        domain: Domain,
        domain_idx: u32,
    ) -> ServiceResult<f64> {
        self.service
            .lock()
            .await
            .read_signal(self.caller.pid, &name, domain, domain_idx)
    }

    async fn write_control(
        self,
        _: tarpc::context::Context,
        name: String,
        domain: Domain,
        domain_idx: u32,
        value: f64,
    ) -> ServiceResult<()> {
        self.service
            .lock()
            .await
            .write_control(self.caller.pid, &name, domain, domain_idx, value)
    }

    async fn start_batch(
        self,
        _: tarpc::context::Context,
        signal_config: Vec<BatchRequest>,
        control_config: Vec<BatchRequest>,
    ) -> ServiceResult<(u32, String)> {
        self.service
            .lock()
            .await
            .start_batch(self.caller.pid, &signal_config, &control_config)
    }

    async fn stop_batch(self, _: tarpc::context::Context, server_pid: u32) -> ServiceResult<()> {
        self.service
            .lock()
            .await
            .stop_batch(self.caller.pid, server_pid)
    }

    async fn restore_control(self, _: tarpc::context::Context) -> ServiceResult<()> {
        self.service.lock().await.restore_control(self.caller.pid)
    }

    async fn start_profile(
        self,
        _: tarpc::context::Context,
        profile_name: String,
    ) -> ServiceResult<()> {
        self.service
            .lock()
            .await
            .start_profile(self.caller.pid, &profile_name)
    }

    async fn stop_profile(
        self,
        _: tarpc::context::Context,
        region_names: Vec<String>,
    ) -> ServiceResult<()> {
        self.service
            .lock()
            .await
            .stop_profile(self.caller.pid, &region_names)
    }

    async fn get_profile_pids(
        self,
        _: tarpc::context::Context,
        profile_name: String,
    ) -> ServiceResult<Option<Vec<u32>>> {
        self.service
            .lock()
            .await
            .get_profile_pids(self.caller.pid, &profile_name)
    }

    async fn pop_profile_region_names(
        self,
        _: tarpc::context::Context,
        profile_name: String,
    ) -> ServiceResult<Vec<String>> {
        self.service
            .lock()
            .await
            .pop_profile_region_names(self.caller.pid, &profile_name)
    }

    async fn lock_control(self, _: tarpc::context::Context) -> ServiceResult<()> {
        self.require_root("lock_control")?;
        self.service.lock().await.lock_control()
    }

    async fn unlock_control(self, _: tarpc::context::Context) -> ServiceResult<()> {
        self.require_root("unlock_control")?;
        self.service.lock().await.unlock_control();
        Ok(())
    }
}

/// Binds the RPC socket, replacing a stale socket left by a previous run.
/// Anything else at `path` is an error.
pub fn bind_socket(path: &Path) -> anyhow::Result<UnixListener> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale socket: {}", path.display()))?;
        }
        Ok(_) => anyhow::bail!("Refusing to replace non-socket file: {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to inspect {}", path.display()));
        }
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind RPC socket: {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))
        .with_context(|| format!("Failed to set permissions of {}", path.display()))?;
    daemon_log("rpc_server", &format!("RPC server listening on {}", path.display()));
    Ok(listener)
}

/// Accepts connections until shutdown is broadcast. Each connection is
/// served on its own task with the peer's identity fixed at accept time.
pub async fn serve_rpc(
    listener: UnixListener,
    service: Arc<Mutex<PlatformService>>,
    accounts: Arc<dyn AccountDb>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let caller = match Caller::from_stream(&stream, accounts.as_ref()) {
                            Ok(caller) => caller,
                            Err(err) => {
                                service_warning(&format!("Rejected connection: {:#}", err));
                                continue;
                            }
                        };
                        daemon_log(
                            "rpc_server",
                            &format!("Connection from {} (PID {})", caller.user, caller.pid),
                        );
                        let server = PlatformServer::new(Arc::clone(&service), caller);
                        let transport = tarpc::serde_transport::new(
                            Framed::new(stream, LengthDelimitedCodec::new()),
                            Bincode::default(),
                        );
                        let channel = server::BaseChannel::with_defaults(transport);

                        tokio::spawn(async move {
                            channel.execute(server.serve()).for_each(|response| async {
                                tokio::spawn(response);
                            }).await;
                        });
                    }
                    Err(e) => {
                        daemon_log("rpc_server", &format!("Accept error: {}", e));
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }
    Ok(())
}
