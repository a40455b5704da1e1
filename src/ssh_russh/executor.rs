use async_trait::async_trait;
use bytes::Bytes;
use russh::{client::Msg, Channel, ChannelMsg};

use crate::transport::{CommandChannel, CommandEvent};

// SSH_EXTENDED_DATA_STDERR
const STDERR_EXT: u32 = 1;

pub(super) struct RusshCommandChannel {
    channel: Channel<Msg>,
}

impl RusshCommandChannel {
    pub(super) fn new(channel: Channel<Msg>) -> Self {
        RusshCommandChannel { channel }
    }
}

#[async_trait]
impl CommandChannel for RusshCommandChannel {
    async fn next_event(&mut self) -> Option<CommandEvent> {
        loop {
            match self.channel.wait().await? {
                ChannelMsg::Data { ref data } => {
                    return Some(CommandEvent::Stdout(Bytes::copy_from_slice(data)))
                }
                ChannelMsg::ExtendedData { ref data, ext } if ext == STDERR_EXT => {
                    return Some(CommandEvent::Stderr(Bytes::copy_from_slice(data)))
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    return Some(CommandEvent::Exit(exit_status as i32))
                }
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.channel.close().await;
    }
}
