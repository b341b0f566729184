//! Reply channel handed in by the command layer
//!
//! Sends are fire-and-forget: a chat front end would forward them to the
//! platform, the console prints them.

use tokio::sync::mpsc;

/// Visibility of a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Only the requester sees it
    Ephemeral,
    /// Everyone in the channel sees it
    Public,
}

/// A message sent back to the requester
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub visibility: Visibility,
    pub text: String,
}

/// Where replies for one request go
pub trait ReplyChannel: Send + Sync {
    /// Reply visible only to the requester
    fn send_ephemeral(&self, text: String);

    /// Reply visible to the whole channel
    fn send_public(&self, text: String);
}

/// Prints replies to stdout
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleReply;

impl ReplyChannel for ConsoleReply {
    fn send_ephemeral(&self, text: String) {
        println!("{}", text);
    }

    fn send_public(&self, text: String) {
        println!("📣 {}", text);
    }
}

/// Forwards replies into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelReply {
    tx: mpsc::UnboundedSender<Reply>,
}

impl ChannelReply {
    /// Create a channel-backed reply handle and its receiving end
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Reply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, visibility: Visibility, text: String) {
        if self.tx.send(Reply { visibility, text }).is_err() {
            tracing::debug!("Reply receiver dropped, discarding message");
        }
    }
}

impl ReplyChannel for ChannelReply {
    fn send_ephemeral(&self, text: String) {
        self.send(Visibility::Ephemeral, text);
    }

    fn send_public(&self, text: String) {
        self.send(Visibility::Public, text);
    }
}
