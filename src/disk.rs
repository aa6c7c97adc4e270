use crate::error::{DriverError, Result};
use crate::vbox::VBoxManager;
use log::debug;
use std::io::Cursor;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// First entry of the seed payload, the guest formats the disk when it sees it
pub const FORMAT_ME_MAGIC: &str = "boot2docker, please format-me";

/// Padding is written in blocks of this size
pub const ZERO_BLOCK: usize = 32 << 10;

/// Build the tar payload placed at the start of a fresh data disk
///
/// Contains the format marker and the public key as `.ssh/authorized_keys{,2}`.
pub fn make_seed_payload(public_key_path: &Path) -> Result<Vec<u8>> {
    let key = std::fs::read(public_key_path)?;

    let mut builder = tar::Builder::new(Vec::new());

    let mut header = tar::Header::new_gnu();
    header.set_size(FORMAT_ME_MAGIC.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, FORMAT_ME_MAGIC, FORMAT_ME_MAGIC.as_bytes())?;

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o700);
    builder.append_data(&mut header, ".ssh/", std::io::empty())?;

    for name in [".ssh/authorized_keys", ".ssh/authorized_keys2"] {
        let mut header = tar::Header::new_gnu();
        header.set_size(key.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, key.as_slice())?;
    }

    Ok(builder.into_inner()?)
}

/// Reader yielding `remaining` zero bytes, at most [ZERO_BLOCK] per read
#[derive(Debug)]
pub struct ZeroFill {
    remaining: u64,
}

impl ZeroFill {
    pub fn new(len: u64) -> Self {
        Self { remaining: len }
    }
}

impl AsyncRead for ZeroFill {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let n = (buf.remaining() as u64)
            .min(self.remaining)
            .min(ZERO_BLOCK as u64) as usize;
        buf.initialize_unfilled_to(n)[..n].fill(0);
        buf.advance(n);
        self.remaining -= n as u64;
        Poll::Ready(Ok(()))
    }
}

/// Convert a raw image into a VMDK at `dest` of exactly `size_mb` MB.
///
/// `payload` is streamed first, then zeros until `size_mb << 20` bytes have
/// been written, the converter fails when the byte count does not match the
/// declared size. Payloads larger than the disk are rejected before anything
/// is written. A partial file at `dest` is left behind on failure.
pub async fn create_disk_image(
    vbox: &dyn VBoxManager,
    dest: &Path,
    size_mb: u64,
    payload: Vec<u8>,
) -> Result<()> {
    let size_bytes = size_mb.checked_mul(1 << 20).ok_or_else(|| {
        DriverError::Config(format!("disk size of {} MB is out of range", size_mb))
    })?;
    let padding = size_bytes
        .checked_sub(payload.len() as u64)
        .ok_or_else(|| {
            DriverError::Config(format!(
                "seed payload of {} bytes does not fit a {} MB disk",
                payload.len(),
                size_mb
            ))
        })?;
    debug!(
        "Creating {} MB disk image {}, {} bytes payload, {} bytes padding",
        size_mb,
        dest.display(),
        payload.len(),
        padding
    );

    let dest = dest.to_string_lossy();
    let size = size_bytes.to_string();
    let mut input = Cursor::new(payload).chain(ZeroFill::new(padding));
    vbox.vbm_pipe(
        &["convertfromraw", "stdin", &dest, &size, "--format", "VMDK"],
        &mut input,
    )
    .await
}

/// Build a fresh data disk embedding `public_key_path`
pub async fn generate_disk_image(
    vbox: &dyn VBoxManager,
    public_key_path: &Path,
    dest: &Path,
    size_mb: u64,
) -> Result<()> {
    let payload = make_seed_payload(public_key_path)?;
    create_disk_image(vbox, dest, size_mb, payload).await
}
