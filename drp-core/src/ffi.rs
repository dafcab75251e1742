//! C ABI for linking drp-core as a static library from C hosts (homebrew plugins, bridges).
//! Profile selector: 0 = network (datagram), 1 = bulk.

use std::os::raw::c_int;
use std::slice;

use crate::chunk::chunk_count;
use crate::integrity;
use crate::wire::{decode_frame, encode_frame, BulkProfile, NetProfile, TransportProfile};

pub const DRP_PROFILE_NET: c_int = 0;
pub const DRP_PROFILE_BULK: c_int = 1;

fn profile(selector: c_int) -> Option<&'static dyn TransportProfile> {
    match selector {
        DRP_PROFILE_NET => Some(&NetProfile),
        DRP_PROFILE_BULK => Some(&BulkProfile),
        _ => None,
    }
}

/// Encode header + payload into out_buf. Returns bytes written, or -1 on error (unknown
/// profile, payload too large, buffer too small).
#[no_mangle]
pub extern "C" fn drp_frame_encode(
    profile_sel: c_int,
    frame_type: u8,
    payload: *const u8,
    payload_len: usize,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    let Some(p) = profile(profile_sel) else {
        return -1;
    };
    if out_buf.is_null() || (payload.is_null() && payload_len != 0) {
        return -1;
    }
    let payload = if payload_len == 0 {
        &[][..]
    } else {
        unsafe { slice::from_raw_parts(payload, payload_len) }
    };
    let frame = match encode_frame(p, frame_type, payload) {
        Ok(f) => f,
        Err(_) => return -1,
    };
    if frame.len() > out_buf_len {
        return -1;
    }
    unsafe {
        out_buf.copy_from_nonoverlapping(frame.as_ptr(), frame.len());
    }
    frame.len() as c_int
}

/// Decode a frame. Writes the type to out_type and copies the payload into out_payload.
/// Returns payload length, or -1 on bad magic, truncation or a too-small buffer.
#[no_mangle]
pub extern "C" fn drp_frame_decode(
    profile_sel: c_int,
    bytes: *const u8,
    len: usize,
    out_type: *mut u8,
    out_payload: *mut u8,
    out_payload_len: usize,
) -> c_int {
    let Some(p) = profile(profile_sel) else {
        return -1;
    };
    if bytes.is_null() || out_type.is_null() || out_payload.is_null() {
        return -1;
    }
    let input = unsafe { slice::from_raw_parts(bytes, len) };
    let frame = match decode_frame(p, input) {
        Ok(f) => f,
        Err(_) => return -1,
    };
    if frame.payload.len() > out_payload_len {
        return -1;
    }
    unsafe {
        *out_type = frame.frame_type;
        out_payload.copy_from_nonoverlapping(frame.payload.as_ptr(), frame.payload.len());
    }
    frame.payload.len() as c_int
}

/// CRC32 (IEEE) of a buffer. 0 for null input.
#[no_mangle]
pub extern "C" fn drp_crc32(data: *const u8, len: usize) -> u32 {
    if data.is_null() {
        return 0;
    }
    let data = unsafe { slice::from_raw_parts(data, len) };
    integrity::checksum(data)
}

/// Number of chunks a blob of `len` bytes needs at `chunk_size`. 0 when either is 0.
#[no_mangle]
pub extern "C" fn drp_chunk_count(len: usize, chunk_size: usize) -> u32 {
    chunk_count(len, chunk_size) as u32
}
