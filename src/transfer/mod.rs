//! Attachment transfer.
//!
//! Attachments announced on the broker socket are registered here with
//! [`open_upload`]; the client then streams them over the transfer socket as
//! binary frames (see [`frame`]), and each [`TransferSession`] turns those
//! frames into a chunk chain.

pub mod frame;
pub mod server;
pub mod session;
pub mod uploads;

use serde::{Deserialize, Serialize};
use serde_json::json;

pub use server::start_transfer_server;
pub use session::{TransferContext, TransferSession};
pub use uploads::{Accept, UploadHandle, UploadState, Uploads};

use crate::broker::topic;
use crate::persistence::DocumentStore;
use crate::persistence::collections::ATTACHMENTS;
use crate::utils::error::TransferError;
use crate::utils::ids::ObjectId;

/// Attachment metadata a client sends along with a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub mime: String,
}

/// Both participants of a private conversation.
pub fn private_audience(sender: &str, recipient: &str) -> Vec<String> {
    let mut audience = vec![topic::inbox(sender)];
    if sender != recipient {
        audience.push(topic::inbox(recipient));
    }
    audience
}

pub fn room_audience(room: ObjectId) -> Vec<String> {
    vec![topic::room(room)]
}

/// Record a pending attachment under `id` (the id of the message carrying it)
/// and start expecting its bytes.
pub async fn open_upload(
    store: &DocumentStore,
    uploads: &UploadHandle,
    id: ObjectId,
    meta: &AttachmentMeta,
    audience: Vec<String>,
) -> Result<(), TransferError> {
    let doc = json!({
        "name": meta.name,
        "size": meta.size,
        "mime": meta.mime,
        "pending": true,
        "failed": false,
    });
    store
        .run_blocking(move |store| store.insert_with_id(ATTACHMENTS, id, doc))
        .await?;
    uploads
        .begin(UploadState::new(id, meta.size, audience))
        .await?;
    Ok(())
}
