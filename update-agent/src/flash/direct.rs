//! Wired flashing: the device erases its firmware area and then pulls the image slice by
//! slice.
use tracing::{debug, info, warn};
use wallet_update_agent_core::{ComponentId, FirmwareVersion};

use super::{Flash, FlashContext, FlashError, image_len, query_features};
use crate::transport::{Command, Features, Response, TransportSession};

/// Length of the legacy header some main firmware images carry in front of the payload.
pub const EMBEDDED_HEADER_LEN: usize = 256;
const LEGACY_MAGIC: &[u8; 4] = b"TRZR";
const PAYLOAD_MAGIC: &[u8; 4] = b"TRZF";
/// First bootloader that expects images without the legacy header.
const HEADERLESS_BOOTLOADER: [u64; 2] = [1, 8];

pub struct DirectWrite;

impl Flash for DirectWrite {
    fn flash(
        &self,
        session: &mut dyn TransportSession,
        image: &[u8],
        ctx: &mut FlashContext<'_>,
    ) -> Result<(), FlashError> {
        let features = enter_bootloader(session, ctx)?;
        let payload =
            strip_embedded_header(ctx.component, image, features.bootloader_version.as_deref());
        let total = image_len(payload)?;

        let erase = Command::FirmwareErase {
            component: ctx.component,
            length: total,
        };
        let mut response = ctx.send(session, &erase)?;
        let mut last_command = erase.name();
        loop {
            match response {
                Response::Success => break,
                Response::FirmwareRequest { offset, length } => {
                    let start = offset as usize;
                    let end = start.saturating_add(length as usize);
                    if length == 0 || end > payload.len() {
                        return Err(FlashError::UnexpectedResponse {
                            command: last_command,
                            response: format!(
                                "request for {length} bytes at {offset} outside image of {total} bytes"
                            ),
                        });
                    }
                    debug!("device requested {length} bytes at offset {offset}");
                    let upload = Command::FirmwareUpload {
                        data: payload[start..end].to_vec(),
                    };
                    response = ctx.send(session, &upload)?;
                    last_command = upload.name();
                    ctx.report(end as u64, u64::from(total));
                }
                other => {
                    return Err(FlashError::UnexpectedResponse {
                        command: last_command,
                        response: format!("{other:?}"),
                    });
                }
            }
        }
        info!("device accepted {total} bytes of {}", ctx.component);
        (ctx.on_progress)(100);
        Ok(())
    }
}

/// Makes sure the device runs its bootloader, rebooting it into it if necessary.
fn enter_bootloader(
    session: &mut dyn TransportSession,
    ctx: &mut FlashContext<'_>,
) -> Result<Features, FlashError> {
    ctx.check_cancel()?;
    let features = query_features(session)?;
    if features.bootloader_mode {
        return Ok(features);
    }

    info!("rebooting device into bootloader");
    match ctx.send(session, &Command::RebootToBootloader) {
        Ok(_) => {}
        // the device drops the link while it reboots
        Err(FlashError::Transport(e)) if e.is_link_lost() => {
            debug!("link dropped during reboot: {e}");
        }
        Err(e) => return Err(e),
    }
    session.disconnect();
    ctx.check_cancel()?;
    session.connect(ctx.address)?;

    let features = query_features(session)?;
    if !features.bootloader_mode {
        warn!("device still not in bootloader mode after reboot");
        return Err(FlashError::BootloaderUnavailable);
    }
    Ok(features)
}

/// Removes the legacy header from main images when the bootloader no longer expects it.
pub fn strip_embedded_header<'a>(
    component: ComponentId,
    image: &'a [u8],
    bootloader_version: Option<&str>,
) -> &'a [u8] {
    let has_header = component == ComponentId::Main
        && image.len() >= EMBEDDED_HEADER_LEN + PAYLOAD_MAGIC.len()
        && image[..4] == LEGACY_MAGIC[..]
        && image[EMBEDDED_HEADER_LEN..EMBEDDED_HEADER_LEN + 4] == PAYLOAD_MAGIC[..];
    if !has_header {
        return image;
    }
    let headerless = bootloader_version
        .and_then(|v| match FirmwareVersion::parse(v) {
            Ok(version) => Some(version),
            Err(e) => {
                warn!("ignoring unparsable bootloader version: {e}");
                None
            }
        })
        .is_some_and(|version| {
            version >= FirmwareVersion::from_segments(HEADERLESS_BOOTLOADER.to_vec())
        });
    if headerless {
        debug!("stripping {EMBEDDED_HEADER_LEN} byte embedded header");
        &image[EMBEDDED_HEADER_LEN..]
    } else {
        image
    }
}
