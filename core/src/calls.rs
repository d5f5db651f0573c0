/// Video calls. Signaling is not implemented; the entry point only logs.
use crate::error::Result;
use tracing::info;

pub async fn start_video_call(peer_id: &str) -> Result<()> {
    info!("Video call to {} requested (not available)", peer_id);
    Ok(())
}
