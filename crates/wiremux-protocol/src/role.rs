//! Connection roles.

/// Which side of the handshake a connection is on.
///
/// The role selects the codec's framing rules: clients mask outbound frames,
/// servers do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn is_client(self) -> bool {
        self == Role::Client
    }
}
