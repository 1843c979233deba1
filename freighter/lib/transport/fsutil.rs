//! Shared filesystem plumbing for the directory-backed transports.

use std::path::Path;

use futures::StreamExt;
use oci_spec::image::Digest;
use sha2::{Digest as _, Sha256};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;

use crate::{FreighterError, FreighterResult};

use super::BlobStream;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Streams a blob to `final_path`, hashing it on the way. The bytes land in
/// a temporary sibling first and are only renamed into place after the
/// digest verifies.
pub(crate) async fn write_blob_file(
    mut stream: BlobStream,
    final_path: &Path,
    expected: Option<&Digest>,
) -> FreighterResult<(Digest, i64)> {
    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp_path = final_path.with_extension(format!("tmp-{:016x}", rand::random::<u64>()));
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&tmp_path)
        .await?;

    let mut hasher = Sha256::new();
    let mut size: i64 = 0;
    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(err) => {
                drop(file);
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };
        hasher.update(&bytes);
        size += bytes.len() as i64;
        file.write_all(&bytes).await?;
    }
    file.flush().await?;
    drop(file);

    let hex = hex::encode(hasher.finalize());
    let actual: Digest = format!("sha256:{}", hex).parse().unwrap();

    if let Some(expected) = expected {
        if actual != *expected {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(FreighterError::BlobTransferFailed(format!(
                "blob digest {} does not match expected digest {}",
                actual, expected
            )));
        }
    }

    fs::rename(&tmp_path, final_path).await?;
    Ok((actual, size))
}

/// Opens a file as a blob stream plus its size.
pub(crate) async fn file_blob_stream(path: &Path) -> FreighterResult<(BlobStream, i64)> {
    let metadata = fs::metadata(path).await.map_err(|_| {
        FreighterError::NotFound(format!("blob file not found: {}", path.display()))
    })?;
    let file = File::open(path).await?;
    let stream = ReaderStream::new(file).map(|item| item.map_err(FreighterError::from));
    Ok((stream.boxed(), metadata.len() as i64))
}
