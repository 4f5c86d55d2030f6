//! Safe wrapper around libfdk-aac's encoder.

use std::ffi::{c_int, c_uint, c_void};
use std::ptr;

use anyhow::{Result, bail};

use super::aac_codec::{CodecBackend, CodecParams, CodecSession};

// ======================== FFI declarations ========================

/// Opaque type for AACENCODER
#[repr(C)]
pub struct AacEncoderInstance {
    _private: [u8; 0],
}

type HandleAacEncoder = *mut AacEncoderInstance;

#[repr(C)]
struct AacEncBufDesc {
    num_bufs: c_int,
    bufs: *mut *mut c_void,
    buffer_identifiers: *mut c_int,
    buf_sizes: *mut c_int,
    buf_el_sizes: *mut c_int,
}

#[repr(C)]
#[derive(Default)]
struct AacEncInArgs {
    num_in_samples: c_int,
    num_anc_bytes: c_int,
}

#[repr(C)]
#[derive(Default)]
struct AacEncOutArgs {
    num_out_bytes: c_int,
    num_in_samples: c_int,
    num_anc_bytes: c_int,
    bit_res_state: c_int,
}

#[repr(C)]
struct AacEncInfoStruct {
    max_out_buf_bytes: c_uint,
    max_anc_bytes: c_uint,
    in_buf_fill_level: c_uint,
    input_channels: c_uint,
    frame_length: c_uint,
    n_delay: c_uint,
    n_delay_core: c_uint,
    conf_buf: [u8; 64],
    conf_size: c_uint,
}

const AACENC_OK: c_int = 0;

// AACENC_PARAM
const AACENC_AOT: c_int = 0x0100;
const AACENC_BITRATE: c_int = 0x0101;
const AACENC_SAMPLERATE: c_int = 0x0103;
const AACENC_CHANNELMODE: c_int = 0x0106;
const AACENC_AFTERBURNER: c_int = 0x0200;
const AACENC_TRANSMUX: c_int = 0x0300;

const MODE_1: c_uint = 1;
const MODE_2: c_uint = 2;
// Raw access units, ADTS is written by the caller
const TT_MP4_RAW: c_uint = 0;

const IN_AUDIO_DATA: c_int = 0;
const OUT_BITSTREAM_DATA: c_int = 3;

unsafe extern "C" {
    fn aacEncOpen(handle: *mut HandleAacEncoder, enc_modules: c_uint, max_channels: c_uint) -> c_int;
    fn aacEncClose(handle: *mut HandleAacEncoder) -> c_int;
    fn aacEncoder_SetParam(handle: HandleAacEncoder, param: c_int, value: c_uint) -> c_int;
    fn aacEncEncode(
        handle: HandleAacEncoder,
        in_desc: *const AacEncBufDesc,
        out_desc: *const AacEncBufDesc,
        in_args: *const AacEncInArgs,
        out_args: *mut AacEncOutArgs,
    ) -> c_int;
    fn aacEncInfo(handle: HandleAacEncoder, info: *mut AacEncInfoStruct) -> c_int;
}

// ======================== Session ========================

/// Owns one AACENCODER handle; closed on drop.
pub struct FdkAacSession {
    handle: HandleAacEncoder,
    frame_length: usize,
}

// The handle is only ever used by the thread that owns the session
unsafe impl Send for FdkAacSession {}

impl FdkAacSession {
    pub fn open(params: &CodecParams) -> Result<Self> {
        let mut handle: HandleAacEncoder = ptr::null_mut();
        let err = unsafe { aacEncOpen(&mut handle, 0, params.channels) };
        if err != AACENC_OK || handle.is_null() {
            bail!("aacEncOpen failed: {:#x}", err);
        }
        // From here on Drop releases the handle on every early return
        let mut session = Self {
            handle,
            frame_length: 0,
        };

        let channel_mode = if params.channels == 1 { MODE_1 } else { MODE_2 };
        session.set_param(AACENC_AOT, params.aot as c_uint, "AOT")?;
        session.set_param(AACENC_SAMPLERATE, params.sample_rate, "SAMPLERATE")?;
        session.set_param(AACENC_CHANNELMODE, channel_mode, "CHANNELMODE")?;
        session.set_param(AACENC_BITRATE, params.bit_rate, "BITRATE")?;
        session.set_param(AACENC_TRANSMUX, TT_MP4_RAW, "TRANSMUX")?;
        session.set_param(AACENC_AFTERBURNER, 1, "AFTERBURNER")?;

        let err = unsafe {
            aacEncEncode(
                session.handle,
                ptr::null(),
                ptr::null(),
                ptr::null(),
                ptr::null_mut(),
            )
        };
        if err != AACENC_OK {
            bail!("aacEncEncode(init) failed: {:#x}", err);
        }

        let mut info = AacEncInfoStruct {
            max_out_buf_bytes: 0,
            max_anc_bytes: 0,
            in_buf_fill_level: 0,
            input_channels: 0,
            frame_length: 0,
            n_delay: 0,
            n_delay_core: 0,
            conf_buf: [0; 64],
            conf_size: 0,
        };
        let err = unsafe { aacEncInfo(session.handle, &mut info) };
        if err != AACENC_OK {
            bail!("aacEncInfo failed: {:#x}", err);
        }
        session.frame_length = info.frame_length as usize;
        Ok(session)
    }

    fn set_param(&mut self, param: c_int, value: c_uint, name: &str) -> Result<()> {
        let err = unsafe { aacEncoder_SetParam(self.handle, param, value) };
        if err != AACENC_OK {
            bail!("aacEncoder_SetParam({}={}) failed: {:#x}", name, value, err);
        }
        Ok(())
    }
}

impl CodecSession for FdkAacSession {
    fn frame_length(&self) -> usize {
        self.frame_length
    }

    fn encode_raw(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize> {
        let mut in_ptr = pcm.as_ptr() as *mut c_void;
        let mut in_id = IN_AUDIO_DATA;
        let mut in_size = std::mem::size_of_val(pcm) as c_int;
        let mut in_el_size = std::mem::size_of::<i16>() as c_int;
        let in_desc = AacEncBufDesc {
            num_bufs: 1,
            bufs: &mut in_ptr,
            buffer_identifiers: &mut in_id,
            buf_sizes: &mut in_size,
            buf_el_sizes: &mut in_el_size,
        };

        let mut out_ptr = out.as_mut_ptr() as *mut c_void;
        let mut out_id = OUT_BITSTREAM_DATA;
        let mut out_size = out.len() as c_int;
        let mut out_el_size: c_int = 1;
        let out_desc = AacEncBufDesc {
            num_bufs: 1,
            bufs: &mut out_ptr,
            buffer_identifiers: &mut out_id,
            buf_sizes: &mut out_size,
            buf_el_sizes: &mut out_el_size,
        };

        let in_args = AacEncInArgs {
            num_in_samples: pcm.len() as c_int,
            num_anc_bytes: 0,
        };
        let mut out_args = AacEncOutArgs::default();

        let err = unsafe { aacEncEncode(self.handle, &in_desc, &out_desc, &in_args, &mut out_args) };
        if err != AACENC_OK {
            bail!("aacEncEncode failed: {:#x}", err);
        }
        Ok(out_args.num_out_bytes.max(0) as usize)
    }
}

impl Drop for FdkAacSession {
    fn drop(&mut self) {
        unsafe {
            aacEncClose(&mut self.handle);
        }
    }
}

/// Opens FDK-AAC encoder sessions.
pub struct FdkAac;

impl CodecBackend for FdkAac {
    fn open(&self, params: &CodecParams) -> Result<Box<dyn CodecSession>> {
        Ok(Box::new(FdkAacSession::open(params)?))
    }
}
