//! Object based device firmware update over Bluetooth LE.
//!
//! The image is split into objects of at most the device's `max_size`. Each object is
//! created, filled with packets no larger than the session's chunk length, checked
//! against a running CRC-32 of everything sent so far, and executed.
use tracing::{debug, info};

use super::{Flash, FlashContext, FlashError, expect_success, image_len};
use crate::transport::{Command, Response, TransportSession};

pub struct Dfu;

impl Flash for Dfu {
    fn flash(
        &self,
        session: &mut dyn TransportSession,
        image: &[u8],
        ctx: &mut FlashContext<'_>,
    ) -> Result<(), FlashError> {
        let total = image_len(image)?;
        let start = Command::DfuStart {
            component: ctx.component,
            size: total,
        };
        let response = ctx.send(session, &start)?;
        expect_success(&start, response)?;

        let select = Command::DfuSelect;
        let (max_size, device_offset, device_crc) = match ctx.send(session, &select)? {
            Response::DfuObjectInfo {
                max_size,
                offset,
                crc,
            } if max_size > 0 => (max_size, offset, crc),
            other => return Err(FlashError::unexpected(&select, &other)),
        };

        let mut offset = resume_offset(image, max_size, device_offset, device_crc);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&image[..offset as usize]);
        if offset > 0 {
            info!("resuming dfu transfer at offset {offset} of {total}");
        }
        if offset > 0 && offset == device_offset {
            // the last object held may never have been executed
            let execute = Command::DfuExecute;
            let response = ctx.send(session, &execute)?;
            expect_success(&execute, response)?;
            ctx.report(u64::from(offset), u64::from(total));
        }

        let packet_len = session.max_chunk_len().max(1);
        while offset < total {
            let end = offset.saturating_add(max_size).min(total);
            let create = Command::DfuCreate { size: end - offset };
            let response = ctx.send(session, &create)?;
            expect_success(&create, response)?;

            let object = &image[offset as usize..end as usize];
            let mut sent = u64::from(offset);
            for packet in object.chunks(packet_len) {
                let write = Command::DfuWrite {
                    data: packet.to_vec(),
                };
                let response = ctx.send(session, &write)?;
                expect_success(&write, response)?;
                hasher.update(packet);
                sent += packet.len() as u64;
                ctx.report(sent, u64::from(total));
            }

            let checksum = Command::DfuChecksum;
            let local_crc = hasher.clone().finalize();
            match ctx.send(session, &checksum)? {
                Response::DfuChecksum { offset: at, crc } if at == end && crc == local_crc => {
                    debug!("object {offset}..{end} verified with crc {crc:#010x}");
                }
                Response::DfuChecksum { offset: at, crc } => {
                    return Err(FlashError::ChecksumMismatch {
                        offset: end,
                        device_offset: at,
                        device_crc: crc,
                        local_crc,
                    });
                }
                other => return Err(FlashError::unexpected(&checksum, &other)),
            }

            let execute = Command::DfuExecute;
            let response = ctx.send(session, &execute)?;
            expect_success(&execute, response)?;
            offset = end;
        }

        info!("dfu transfer of {total} bytes for {} complete", ctx.component);
        (ctx.on_progress)(100);
        Ok(())
    }
}

/// Where to continue when the device already holds a prefix of the image.
///
/// Only whole objects are kept: a partially written object is sent again. A result
/// equal to `device_offset` means the device holds complete objects only.
fn resume_offset(image: &[u8], max_size: u32, device_offset: u32, device_crc: u32) -> u32 {
    let Some(prefix) = image.get(..device_offset as usize) else {
        return 0;
    };
    if device_offset == 0 || crc32fast::hash(prefix) != device_crc {
        return 0;
    }
    device_offset - device_offset % max_size
}
