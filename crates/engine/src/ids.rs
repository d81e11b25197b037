/// Which end of the connection an engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Listens, and assigns the session id.
    Context,
    /// Connects out, and adopts the session id.
    Frame,
}

/// Hands out command ids in steps of two.
///
/// The context role draws odd ids and the frame role even ones, so ids
/// generated independently on each side never collide. Wrapping keeps the
/// parity because the counter space is even.
#[derive(Debug)]
pub(crate) struct CommandIds {
    next: u32,
}

impl CommandIds {
    pub(crate) fn new(role: Role) -> Self {
        let next = match role {
            Role::Context => 1,
            Role::Frame => 2,
        };
        Self { next }
    }

    pub(crate) fn allocate(&mut self) -> u32 {
        let id = self.next;
        self.next = self.next.wrapping_add(2);
        id
    }
}
