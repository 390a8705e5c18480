//! Error handling helpers and primitives.

use anyhow::Error;
use thiserror::Error;

/// Chain creates a string from an error stack.
pub fn chain(res: Error) -> String {
    res.chain()
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

/// The four error classes named in the dispatcher's error handling design:
/// protocol framing failures, user-facing command errors, helper-script
/// failures, and fatal system-call failures. Handlers match on this to
/// decide whether to answer with a `RESPONSE`, stream inline text, or tear
/// the whole peer/daemon down.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Short read of a known-size header or an unrecognized command code.
    /// The peer connection must be closed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Unknown instance, duplicate console attach, malformed/oversized
    /// build context. Answered with a non-zero `RESPONSE`; the peer
    /// handler continues or returns cleanly.
    #[error("{0}")]
    User(String),

    /// A helper script (`stage_init.sh`, `stage_build.sh`, ...) exited
    /// non-zero. Reported inline on the client stream; aborts the build
    /// pipeline but does not take down the daemon.
    #[error("helper {helper} failed with code {code}")]
    Helper { helper: String, code: i32 },

    /// `open`/`read`/`write`/`poll`/`fork`/`execve`/`ioctl`/`tcsetattr`
    /// failures. Fatal inside the pump and console-attach paths per the
    /// source; propagated with `anyhow::Error` context chains.
    #[error("system error: {0}")]
    System(#[from] std::io::Error),
}

impl DispatchError {
    /// Map to the `RESPONSE.ecode` a client should see for this error.
    pub fn ecode(&self) -> i32 {
        match self {
            DispatchError::User(_) => 1,
            DispatchError::Protocol(_) => -1,
            DispatchError::Helper { .. } => -1,
            DispatchError::System(_) => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn chain_joins_context() {
        let first = anyhow!("error 1");
        let second = anyhow!("error 2");

        let res = super::chain(first.context(second));

        assert_eq!(res, "error 2: error 1");
    }

    #[test]
    fn user_error_ecode_is_one() {
        let e = DispatchError::User("already attached".into());
        assert_eq!(e.ecode(), 1);
    }

    #[test]
    fn helper_error_ecode_is_negative_one() {
        let e = DispatchError::Helper {
            helper: "stage_build.sh".into(),
            code: 1,
        };
        assert_eq!(e.ecode(), -1);
    }
}
