//! In-process message router backed by tokio channels.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use super::types::{Address, Mailbox, Message};

#[derive(Default)]
struct Routes {
    senders: HashMap<Address, mpsc::UnboundedSender<Message>>,
    dropped: HashSet<Address>,
}

/// Delivers messages between sites and initiators living in one process.
/// Messages to a deregistered address are discarded, the way a network
/// would lose them after a node dies.
#[derive(Clone, Default)]
pub struct LocalRouter {
    routes: Arc<RwLock<Routes>>,
}

impl LocalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an inbox for `address`, replacing any previous one.
    pub fn register(&self, address: Address) -> anyhow::Result<mpsc::UnboundedReceiver<Message>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = self
            .routes
            .write()
            .map_err(|_| anyhow::anyhow!("router lock poisoned"))?;
        routes.dropped.remove(&address);
        routes.senders.insert(address, tx);
        Ok(rx)
    }

    /// Close the inbox for `address`. Later sends to it are discarded.
    pub fn deregister(&self, address: Address) -> anyhow::Result<()> {
        let mut routes = self
            .routes
            .write()
            .map_err(|_| anyhow::anyhow!("router lock poisoned"))?;
        routes.senders.remove(&address);
        routes.dropped.insert(address);
        Ok(())
    }

    pub fn is_registered(&self, address: Address) -> bool {
        self.routes
            .read()
            .map(|routes| routes.senders.contains_key(&address))
            .unwrap_or(false)
    }
}

impl Mailbox for LocalRouter {
    fn send(&self, to: Address, message: Message) -> anyhow::Result<()> {
        let routes = self
            .routes
            .read()
            .map_err(|_| anyhow::anyhow!("router lock poisoned"))?;
        match routes.senders.get(&to) {
            Some(sender) => {
                if sender.send(message).is_err() {
                    tracing::debug!(%to, "inbox closed; message discarded");
                }
                Ok(())
            }
            None if routes.dropped.contains(&to) => {
                tracing::trace!(%to, kind = message.kind(), "destination gone; message discarded");
                Ok(())
            }
            None => anyhow::bail!("no route to {to}"),
        }
    }
}
