//! Multipart wire framing for the TCP transport.
//!
//! A message is a part count byte followed by length-prefixed parts
//! (`u32` LE length, then the bytes). Inbound messages carry the sender
//! identity as the first part and the payload as the last; a three-part form
//! with an empty delimiter in the middle is tolerated.

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const MAX_PARTS: usize = 8;
const MAX_PART_SIZE: usize = 4 * 1024 * 1024;

pub async fn write_parts<W: AsyncWriteExt + Unpin>(writer: &mut W, parts: &[&[u8]]) -> Result<()> {
    anyhow::ensure!(
        !parts.is_empty() && parts.len() <= MAX_PARTS,
        "bad part count: {}",
        parts.len()
    );
    writer
        .write_all(&[parts.len() as u8])
        .await
        .context("write part count")?;
    for part in parts {
        anyhow::ensure!(part.len() <= MAX_PART_SIZE, "part too large: {} bytes", part.len());
        writer
            .write_all(&(part.len() as u32).to_le_bytes())
            .await
            .context("write part length")?;
        writer.write_all(part).await.context("write part")?;
    }
    writer.flush().await.context("flush")?;
    Ok(())
}

pub async fn read_parts<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<Vec<u8>>> {
    let mut count_buf = [0u8; 1];
    reader
        .read_exact(&mut count_buf)
        .await
        .context("read part count")?;
    let count = count_buf[0] as usize;
    anyhow::ensure!(count >= 1 && count <= MAX_PARTS, "bad part count: {count}");

    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        let mut len_buf = [0u8; 4];
        reader
            .read_exact(&mut len_buf)
            .await
            .context("read part length")?;
        let len = u32::from_le_bytes(len_buf) as usize;
        anyhow::ensure!(len <= MAX_PART_SIZE, "part too large: {len} bytes");
        let mut part = vec![0u8; len];
        reader.read_exact(&mut part).await.context("read part")?;
        parts.push(part);
    }
    Ok(parts)
}
