pub mod codec;
mod deserialize;
pub mod msg;
mod node;
mod receiver;
mod sender;
mod serialize;

use tokio::io::{AsyncRead, AsyncWrite};

pub use codec::{Codec, F32Codec};
pub use deserialize::Deserialize;
pub use node::NodeId;
pub use receiver::MsgReceiver;
pub use sender::MsgSender;
pub use serialize::Serialize;

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// Frames announcing more than this many bytes are rejected before allocating.
pub const MAX_FRAME_LEN: usize = 512 * 1024 * 1024;

/// Creates both `MsgReceiver` and `MsgSender` network channel parts.
///
/// Given a reader and a writer creates and returns both ends of the communication.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// A communication stream in the form of a message receiver and sender.
pub fn channel<R, W>(rx: R, tx: W) -> (MsgReceiver<R>, MsgSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (MsgReceiver::new(rx), MsgSender::new(tx))
}
