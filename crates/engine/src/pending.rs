//! Tracking requests that are waiting for a reply
//!
//! When a correlated command is sent, its header and handler are recorded
//! here. When a command arrives whose `(ctx_id, command_id)` matches, the entry
//! is removed and its handler handed back to the dispatcher.

use protocol::{Command, CommandHeader};

use crate::EngineError;

/// Callback run once with the reply to a request, or with
/// [`EngineError::ConnectionClosed`] if the connection closed first.
pub type ResponseHandler = Box<dyn FnOnce(Result<Command, EngineError>) + Send + 'static>;

struct PendingResponse {
    header: CommandHeader,
    handler: ResponseHandler,
}

impl PendingResponse {
    fn matches(&self, ctx_id: i32, command_id: u32) -> bool {
        self.header.ctx_id == ctx_id && self.header.command_id == command_id
    }
}

/// Outstanding requests, oldest first.
#[derive(Default)]
pub(crate) struct PendingResponses {
    entries: Vec<PendingResponse>,
}

impl PendingResponses {
    /// Record a request.
    ///
    /// Returns the handler of an entry with the same key that this one
    /// replaces, so the caller can abandon it.
    pub(crate) fn insert(
        &mut self,
        header: CommandHeader,
        handler: ResponseHandler,
    ) -> Option<ResponseHandler> {
        let replaced = self
            .entries
            .iter()
            .position(|entry| entry.matches(header.ctx_id, header.command_id))
            .map(|index| self.entries.remove(index).handler);

        self.entries.push(PendingResponse { header, handler });
        replaced
    }

    /// Remove and return the handler waiting for `(ctx_id, command_id)`.
    pub(crate) fn take(&mut self, ctx_id: i32, command_id: u32) -> Option<ResponseHandler> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.matches(ctx_id, command_id))?;
        Some(self.entries.remove(index).handler)
    }

    /// Remove every entry, oldest first.
    pub(crate) fn drain(&mut self) -> Vec<ResponseHandler> {
        self.entries.drain(..).map(|entry| entry.handler).collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use protocol::CommandType;

    use super::*;

    fn header(ctx_id: i32, command_id: u32) -> CommandHeader {
        CommandHeader {
            command_type: CommandType::Eval,
            ctx_id,
            command_id,
            data_size: 0,
        }
    }

    fn recording(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> ResponseHandler {
        let log = Arc::clone(log);
        Box::new(move |reply| {
            let outcome = match reply {
                Ok(command) => format!("{name}:{}", command.command_type()),
                Err(e) => format!("{name}:{e}"),
            };
            log.lock().unwrap().push(outcome);
        })
    }

    #[test]
    fn take_matches_both_ids() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pending = PendingResponses::default();
        pending.insert(header(1, 3), recording(&log, "a"));
        pending.insert(header(2, 3), recording(&log, "b"));

        assert!(pending.take(1, 5).is_none());
        let handler = pending.take(2, 3).unwrap();
        handler(Ok(Command::empty(CommandType::ValueString, 2, 3)));

        assert_eq!(pending.len(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["b:value-string"]);
        assert!(pending.take(2, 3).is_none());
    }

    #[test]
    fn duplicate_key_replaces_older_entry() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pending = PendingResponses::default();
        assert!(pending.insert(header(1, 3), recording(&log, "old")).is_none());

        let replaced = pending.insert(header(1, 3), recording(&log, "new")).unwrap();
        replaced(Err(EngineError::ConnectionClosed));

        assert_eq!(pending.len(), 1);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["old:connection closed before a reply arrived"]
        );
    }

    #[test]
    fn drain_empties_in_insertion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pending = PendingResponses::default();
        pending.insert(header(1, 1), recording(&log, "first"));
        pending.insert(header(1, 3), recording(&log, "second"));

        for handler in pending.drain() {
            handler(Err(EngineError::ConnectionClosed));
        }

        assert!(pending.is_empty());
        let log = log.lock().unwrap();
        assert!(log[0].starts_with("first:"));
        assert!(log[1].starts_with("second:"));
    }
}
