use super::{Request, Response};
use crate::process::Launcher;
use crate::types::PeerCredentials;
use log::{info, warn};
use std::{os::fd::OwnedFd, sync::Arc};

/// A response frame plus, for shells, the descriptor to pass with it.
#[derive(Debug)]
pub struct Reply {
    pub response: Response,
    pub fd: Option<OwnedFd>,
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Self { response, fd: None }
    }
}

pub struct CommandHandlers {
    launcher: Arc<Launcher>,
}

impl CommandHandlers {
    pub fn new(launcher: Arc<Launcher>) -> Self {
        Self { launcher }
    }

    pub fn dispatch(
        &self,
        request: Request,
        peer: Option<&PeerCredentials>,
    ) -> Reply {
        match request {
            Request::Ping { data } => Response::Ping { data }.into(),
            Request::RunProgram { path, pwd, args } => {
                info!(
                    "Run program request received: {} {}",
                    path,
                    args.join(" ")
                );
                match self.launcher.launch(&path, &pwd, &args) {
                    Ok(_) => Response::Ok.into(),
                    Err(e) => Response::error(format!("{:#}", e)).into(),
                }
            }
            Request::RunShell { term } => {
                let Some(peer) = peer else {
                    return Response::error(
                        "No credentials received for RunShell command",
                    )
                    .into();
                };
                match self.launcher.launch_shell(&term, peer) {
                    Ok(master) => Reply {
                        response: Response::Ok,
                        fd: Some(master),
                    },
                    Err(e) => {
                        warn!(
                            "Failed to open shell for pid {}: {:#}",
                            peer.pid, e
                        );
                        Response::error(format!("{:#}", e)).into()
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::decode::fixtures::descriptor;
    use crate::process::{ChildRegistry, LaunchEnv};
    use crate::types::CredentialContext;
    use nix::unistd::{Gid, Uid};

    fn handlers() -> CommandHandlers {
        let descriptor = descriptor();
        let launcher = Launcher::new(
            Arc::new(ChildRegistry::new()),
            CredentialContext::from_descriptor(&descriptor),
            LaunchEnv::build(&descriptor.launch_env, None),
            descriptor.profile.clone(),
            descriptor.config.clone(),
        );
        CommandHandlers::new(Arc::new(launcher))
    }

    #[test]
    fn test_ping_echoes() {
        let reply = handlers().dispatch(
            Request::Ping {
                data: "hello \u{1F600}".to_string(),
            },
            None,
        );
        assert_eq!(
            reply.response,
            Response::Ping {
                data: "hello \u{1F600}".to_string()
            }
        );
        assert!(reply.fd.is_none());
    }

    #[test]
    fn test_run_program_failure_is_error_response() {
        let reply = handlers().dispatch(
            Request::RunProgram {
                path: "/nonexistent".to_string(),
                pwd: String::new(),
                args: Vec::new(),
            },
            None,
        );
        match reply.response {
            Response::Error { msg } => assert!(msg.contains("/nonexistent")),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_run_shell_without_credentials() {
        let reply = handlers().dispatch(
            Request::RunShell {
                term: "xterm".to_string(),
            },
            None,
        );
        assert_eq!(
            reply.response,
            Response::error("No credentials received for RunShell command")
        );
        assert!(reply.fd.is_none());
    }

    #[test]
    fn test_run_shell_as_root_refused() {
        let peer = PeerCredentials {
            pid: 10,
            uid: Uid::from_raw(0),
            gid: Gid::from_raw(0),
        };
        let reply = handlers().dispatch(
            Request::RunShell {
                term: String::new(),
            },
            Some(&peer),
        );
        assert_eq!(
            reply.response,
            Response::error(
                "Cannot open shell because allow_root_shell is disabled"
            )
        );
        assert!(reply.fd.is_none());
    }
}
