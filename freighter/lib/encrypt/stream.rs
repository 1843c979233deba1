//! Chunked AES-GCM stream sealing.
//!
//! Wire format:
//!
//! ```text
//! u32_be(header_len) || header || nonce(12) || (u32_be(chunk_len) || chunk)*
//! ```
//!
//! The header is an [`Envelope`] with format `"AES-GCM-STREAM"` and no
//! ciphertext field. Plaintext chunks are at most 64 KiB. The stored nonce
//! is a 4-byte random prefix plus an 8-byte big-endian starting counter;
//! chunk `i` is sealed under `prefix || (start + i)`, so no two chunks ever
//! share a nonce.

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{FreighterError, FreighterResult};

use super::{
    cipher::{AeadCipher, GCM_NONCE_SIZE, GCM_TAG_SIZE},
    EncryptOptions, Envelope, EnvelopeManager, ENVELOPE_FORMAT_AES_GCM_STREAM,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The maximum plaintext chunk size.
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on a plausible header length.
const MAX_HEADER_LEN: usize = 1024 * 1024;

/// Upper bound on a plausible encrypted chunk length.
const MAX_CHUNK_LEN: usize = STREAM_CHUNK_SIZE + GCM_TAG_SIZE;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EnvelopeManager {
    /// Encrypts a byte stream into the chunked wire format. Empty input
    /// still yields a valid header, nonce, and zero chunks.
    pub async fn encrypt_stream<R, W>(
        &self,
        mut reader: R,
        mut writer: W,
        opts: &EncryptOptions,
    ) -> FreighterResult<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let provider_name = self.resolve_provider_name(None, opts);
        let provider = self.provider(&provider_name)?;
        let data_key = provider
            .generate_data_key(*self.config().get_data_key_length())
            .await?;
        let cipher = AeadCipher::new(data_key.get_plaintext())?;

        let header = Envelope::stream_header(
            data_key.get_encrypted().clone(),
            provider.get_key_info(),
        )
        .encode()?;
        writer.write_all(&(header.len() as u32).to_be_bytes()).await?;
        writer.write_all(&header).await?;

        let mut prefix = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut prefix);
        let nonce = chunk_nonce(&prefix, 0);
        writer.write_all(&nonce).await?;

        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        let mut counter: u64 = 0;
        loop {
            let len = fill_chunk(&mut reader, &mut buf).await?;
            if len == 0 {
                break;
            }

            let sealed = cipher.seal(&chunk_nonce(&prefix, counter), &buf[..len])?;
            writer.write_all(&(sealed.len() as u32).to_be_bytes()).await?;
            writer.write_all(&sealed).await?;
            counter += 1;

            if len < STREAM_CHUNK_SIZE {
                break;
            }
        }

        writer.flush().await?;
        Ok(())
    }

    /// Decrypts the chunked wire format back into a byte stream.
    pub async fn decrypt_stream<R, W>(
        &self,
        mut reader: R,
        mut writer: W,
        opts: &EncryptOptions,
    ) -> FreighterResult<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await.map_err(|_| {
            FreighterError::MalformedStream("failed to read header length".into())
        })?;
        let header_len = u32::from_be_bytes(len_buf) as usize;
        if header_len == 0 || header_len > MAX_HEADER_LEN {
            return Err(FreighterError::MalformedStream(format!(
                "stream header length {} implausible",
                header_len
            )));
        }

        let mut header_buf = vec![0u8; header_len];
        reader.read_exact(&mut header_buf).await.map_err(|_| {
            FreighterError::MalformedStream("failed to read header".into())
        })?;
        let header = Envelope::decode(&header_buf)
            .map_err(|_| FreighterError::MalformedStream("corrupted stream header".into()))?;
        if header.get_envelope_format() != ENVELOPE_FORMAT_AES_GCM_STREAM {
            return Err(FreighterError::MalformedStream(format!(
                "unexpected envelope format {}",
                header.get_envelope_format()
            )));
        }

        let provider_name = self.resolve_provider_name(header.provider_name(), opts);
        let provider = self.provider(&provider_name)?;
        let data_key = provider.decrypt(header.get_encrypted_key()).await?;
        let cipher = AeadCipher::new(&data_key)?;

        let mut nonce = [0u8; GCM_NONCE_SIZE];
        reader.read_exact(&mut nonce).await.map_err(|_| {
            FreighterError::MalformedStream("failed to read stream nonce".into())
        })?;
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&nonce[..4]);
        let start = u64::from_be_bytes(nonce[4..].try_into().unwrap());

        let mut counter: u64 = 0;
        loop {
            let mut len_buf = [0u8; 4];
            let n = reader.read(&mut len_buf).await?;
            if n == 0 {
                break;
            }
            if n < 4 {
                reader.read_exact(&mut len_buf[n..]).await.map_err(|_| {
                    FreighterError::MalformedStream("truncated chunk length".into())
                })?;
            }
            let chunk_len = u32::from_be_bytes(len_buf) as usize;
            if chunk_len == 0 || chunk_len > MAX_CHUNK_LEN {
                return Err(FreighterError::MalformedStream(format!(
                    "chunk length {} implausible",
                    chunk_len
                )));
            }

            let mut sealed = vec![0u8; chunk_len];
            reader.read_exact(&mut sealed).await.map_err(|_| {
                FreighterError::MalformedStream("truncated chunk".into())
            })?;

            let plaintext = cipher.open(&chunk_nonce(&prefix, start.wrapping_add(counter)), &sealed)?;
            writer.write_all(&plaintext).await?;
            counter += 1;
        }

        writer.flush().await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Derives the nonce for chunk `counter`: the 4-byte prefix followed by the
/// big-endian counter.
fn chunk_nonce(prefix: &[u8; 4], counter: u64) -> [u8; GCM_NONCE_SIZE] {
    let mut nonce = [0u8; GCM_NONCE_SIZE];
    nonce[..4].copy_from_slice(prefix);
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Reads until the buffer is full or the reader is exhausted, returning the
/// number of bytes read.
async fn fill_chunk<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> FreighterResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
