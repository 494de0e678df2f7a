use crate::transport::Web3;
use anyhow::{anyhow, Context as _, Result};
use primitive_types::H256;
use std::time::Duration;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use web3::types::{BlockId, BlockNumber};

/// Number and hash of a chain head observation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockInfo {
    pub number: u64,
    pub hash: H256,
}

/// A receiver of the current block that is always up to date.
pub type CurrentBlockStream = watch::Receiver<BlockInfo>;

/// Creates a stream that yields the current block whenever it changes and
/// spawns the background task driving the updates.
///
/// The stream is not guaranteed to yield every block individually without
/// gaps but it does yield the newest block whenever it changes.
pub async fn current_block_stream(
    web3: Web3,
    poll_interval: Duration,
) -> Result<CurrentBlockStream> {
    let initial = current_block(&web3).await?;
    let (sender, receiver) = watch::channel(initial);
    let update_future = async move {
        let mut previous = initial;
        loop {
            tokio::time::sleep(poll_interval).await;
            let block = match current_block(&web3).await {
                Ok(block) => block,
                Err(err) => {
                    tracing::warn!(?err, "failed to get current block");
                    continue;
                }
            };
            if block.hash == previous.hash {
                continue;
            }
            if sender.send(block).is_err() {
                break;
            }
            tracing::debug!(number = block.number, "new current block");
            previous = block;
        }
    };
    tokio::task::spawn(update_future);
    Ok(receiver)
}

/// Adapts the watch receiver into a `Stream` yielding the current value and
/// every subsequent change.
pub fn into_stream(receiver: CurrentBlockStream) -> WatchStream<BlockInfo> {
    WatchStream::new(receiver)
}

async fn current_block(web3: &Web3) -> Result<BlockInfo> {
    let block = web3
        .eth()
        .block(BlockId::Number(BlockNumber::Latest))
        .await
        .context("failed to get current block")?
        .ok_or_else(|| anyhow!("no current block"))?;
    let number = block
        .number
        .ok_or_else(|| anyhow!("current block missing number"))?
        .as_u64();
    let hash = block.hash.ok_or_else(|| anyhow!("current block missing hash"))?;
    Ok(BlockInfo { number, hash })
}
