//! Raw media crossing the host boundary: captured frames going out to the
//! published local tracks, decoded frames coming back from remote tracks.

use crate::errors::CallError;

/// Interleaved 16-bit PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u32,
}

impl PcmFrame {
    pub fn samples_per_channel(&self) -> u32 {
        if self.channels == 0 {
            return 0;
        }
        (self.samples.len() / self.channels as usize) as u32
    }

    pub fn validate(&self) -> Result<(), CallError> {
        if self.channels == 0 || self.sample_rate == 0 {
            return Err(CallError::ControlCommandFailed(format!(
                "bad audio format: {} Hz, {} channels",
                self.sample_rate, self.channels
            )));
        }
        if self.samples.len() % self.channels as usize != 0 {
            return Err(CallError::ControlCommandFailed(format!(
                "{} samples do not split into {} channels",
                self.samples.len(),
                self.channels
            )));
        }
        Ok(())
    }
}

/// A video frame as three tightly packed I420 planes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I420Frame {
    pub width: u32,
    pub height: u32,
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
}

impl I420Frame {
    /// Width and height of the two chroma planes.
    pub fn chroma_size(width: u32, height: u32) -> (u32, u32) {
        (width.div_ceil(2), height.div_ceil(2))
    }

    /// Repack strided planes, e.g. a decoder's output buffer.
    ///
    /// Rows missing from a short source plane are left black.
    pub fn from_strided(width: u32, height: u32, planes: [(&[u8], u32); 3]) -> Self {
        let (chroma_w, chroma_h) = Self::chroma_size(width, height);
        let [(y, y_stride), (u, u_stride), (v, v_stride)] = planes;
        Self {
            width,
            height,
            y: pack_plane(y, y_stride, width, height, 0),
            u: pack_plane(u, u_stride, chroma_w, chroma_h, 128),
            v: pack_plane(v, v_stride, chroma_w, chroma_h, 128),
        }
    }

    pub fn validate(&self) -> Result<(), CallError> {
        let (chroma_w, chroma_h) = Self::chroma_size(self.width, self.height);
        let luma = self.width as usize * self.height as usize;
        let chroma = chroma_w as usize * chroma_h as usize;
        if luma == 0 || self.y.len() != luma || self.u.len() != chroma || self.v.len() != chroma {
            return Err(CallError::ControlCommandFailed(format!(
                "bad I420 frame {}x{}: planes {}/{}/{}",
                self.width,
                self.height,
                self.y.len(),
                self.u.len(),
                self.v.len()
            )));
        }
        Ok(())
    }
}

fn pack_plane(src: &[u8], stride: u32, width: u32, rows: u32, fill: u8) -> Vec<u8> {
    let width = width as usize;
    let mut out = Vec::with_capacity(width * rows as usize);
    for row in 0..rows as usize {
        let start = row * stride as usize;
        match src.get(start..start + width) {
            Some(line) => out.extend_from_slice(line),
            None => out.resize(out.len() + width, fill),
        }
    }
    out
}

/// Receives decoded frames of one remote video publication.
pub trait VideoSink: Send + Sync {
    fn on_frame(&self, frame: I420Frame);
}

/// Receives decoded PCM of every subscribed remote microphone.
pub trait AudioSink: Send + Sync {
    fn on_audio(&self, publication_sid: &str, frame: PcmFrame);
}
