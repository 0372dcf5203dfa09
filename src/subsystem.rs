//! Named subsystems that take over a session channel.

use async_trait::async_trait;

use crate::transport::BoxedChannel;

/// The file-transfer subsystem name.
pub const SFTP_SUBSYSTEM: &str = "sftp";

/// A protocol handler that owns a channel once its subsystem is negotiated.
///
/// The multiplexer closes the channel after `serve` returns, whether or not
/// it succeeded.
#[async_trait]
pub trait SubsystemHandler: Send + Sync {
    async fn serve(&self, channel: &mut BoxedChannel) -> anyhow::Result<()>;
}
