//! PCM mixing kernels.
//!
//! Sources are summed in a wide accumulator with their Q16 volume ramp
//! applied, then clamped to the range of the output format. Integer samples
//! never wrap.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::borrow::Borrow;

use mixd_core::{Error, Result, SampleFormat};

use crate::buffer::{UNITY_VOLUME, VOLUME_SHIFT};

/// One span contributing to a mix.
#[derive(Debug, Clone, Copy)]
pub struct MixSource<'a> {
    pub data: &'a [u8],
    /// Q16 gain at the first frame.
    pub volume_start: i32,
    /// Q16 gain at the last frame.
    pub volume_end: i32,
    pub muted: bool,
}

impl<'a> MixSource<'a> {
    /// Unity gain, unmuted.
    pub const fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            volume_start: UNITY_VOLUME,
            volume_end: UNITY_VOLUME,
            muted: false,
        }
    }

    const fn is_unity(&self) -> bool {
        self.volume_start == UNITY_VOLUME && self.volume_end == UNITY_VOLUME
    }
}

/// Byte value of silence for `format`.
pub const fn silence_byte(format: SampleFormat) -> u8 {
    match format {
        SampleFormat::U8 => 0x80,
        _ => 0,
    }
}

pub fn fill_silence(dst: &mut [u8], format: SampleFormat) {
    dst.fill(silence_byte(format));
}

/// True if every sample in `data` is silence.
pub fn is_silent(data: &[u8], format: SampleFormat) -> bool {
    let silence = silence_byte(format);
    data.iter().all(|&b| b == silence)
}

/// Mix `sources` into `dst`.
///
/// No active source yields silence. A single unity-gain source is copied
/// through untouched. The source iterator is cloned instead of collected, so
/// mixing does not allocate.
pub fn mix_into<'s, I, S>(
    dst: &mut [u8],
    sources: I,
    format: SampleFormat,
    channels: u16,
) -> Result<()>
where
    I: IntoIterator<Item = S>,
    I::IntoIter: Clone,
    S: Borrow<MixSource<'s>>,
{
    let frame_bytes = channels as usize * format.bytes_per_sample() as usize;
    if frame_bytes == 0 || dst.len() % frame_bytes != 0 {
        return Err(Error::invalid_param(format!(
            "mix target of {} bytes is not whole {channels}ch {format} frames",
            dst.len()
        )));
    }
    let sources = sources.into_iter();
    for source in sources.clone() {
        let source = as_source(&source);
        if source.data.len() < dst.len() {
            return Err(Error::invalid_param(format!(
                "mix source of {} bytes shorter than target {}",
                source.data.len(),
                dst.len()
            )));
        }
    }

    let active = sources.filter(|s| !as_source(s).muted);
    let mut lookahead = active.clone();
    match (lookahead.next(), lookahead.next()) {
        (None, _) => fill_silence(dst, format),
        (Some(only), None) if as_source(&only).is_unity() => {
            dst.copy_from_slice(&as_source(&only).data[..dst.len()]);
        }
        _ => {
            let frames = dst.len() / frame_bytes;
            match format {
                SampleFormat::F32Le => mix_float(dst, active, frames, channels as usize),
                _ => mix_int(dst, active, format, frames, channels as usize),
            }
        }
    }
    Ok(())
}

fn as_source<'r, 's, S: Borrow<MixSource<'s>>>(source: &'r S) -> &'r MixSource<'s> {
    <S as Borrow<MixSource<'s>>>::borrow(source)
}

/// Q16 gain of `frame` within a ramp over `frames` frames.
fn ramp_gain(source: &MixSource<'_>, frame: usize, frames: usize) -> i64 {
    let start = i64::from(source.volume_start);
    if frames <= 1 || source.volume_start == source.volume_end {
        return start;
    }
    let end = i64::from(source.volume_end);
    start + (end - start) * frame as i64 / (frames - 1) as i64
}

const fn int_range(format: SampleFormat) -> (i64, i64) {
    match format {
        SampleFormat::U8 => (i8::MIN as i64, i8::MAX as i64),
        SampleFormat::S16Le => (i16::MIN as i64, i16::MAX as i64),
        SampleFormat::S24Le => (-(1 << 23), (1 << 23) - 1),
        SampleFormat::S32Le | SampleFormat::F32Le => (i32::MIN as i64, i32::MAX as i64),
    }
}

fn read_int(format: SampleFormat, bytes: &[u8]) -> i64 {
    match format {
        SampleFormat::U8 => i64::from(bytes[0]) - 128,
        SampleFormat::S16Le => i64::from(i16::from_le_bytes([bytes[0], bytes[1]])),
        SampleFormat::S24Le => {
            let raw = i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]);
            i64::from(raw >> 8)
        }
        SampleFormat::S32Le | SampleFormat::F32Le => {
            i64::from(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
    }
}

fn write_int(format: SampleFormat, value: i64, out: &mut [u8]) {
    match format {
        SampleFormat::U8 => out[0] = (value + 128) as u8,
        SampleFormat::S16Le => out.copy_from_slice(&(value as i16).to_le_bytes()),
        SampleFormat::S24Le => out.copy_from_slice(&(value as i32).to_le_bytes()[..3]),
        SampleFormat::S32Le | SampleFormat::F32Le => {
            out.copy_from_slice(&(value as i32).to_le_bytes());
        }
    }
}

fn mix_int<'s, S: Borrow<MixSource<'s>>>(
    dst: &mut [u8],
    sources: impl Iterator<Item = S> + Clone,
    format: SampleFormat,
    frames: usize,
    channels: usize,
) {
    let width = format.bytes_per_sample() as usize;
    let (min, max) = int_range(format);

    for frame in 0..frames {
        for ch in 0..channels {
            let at = (frame * channels + ch) * width;
            let mut acc: i64 = 0;
            for source in sources.clone() {
                let source = as_source(&source);
                let sample = read_int(format, &source.data[at..at + width]);
                acc += (sample * ramp_gain(source, frame, frames)) >> VOLUME_SHIFT;
            }
            write_int(format, acc.clamp(min, max), &mut dst[at..at + width]);
        }
    }
}

fn mix_float<'s, S: Borrow<MixSource<'s>>>(
    dst: &mut [u8],
    sources: impl Iterator<Item = S> + Clone,
    frames: usize,
    channels: usize,
) {
    const WIDTH: usize = 4;
    let unity = f64::from(UNITY_VOLUME);

    for frame in 0..frames {
        for ch in 0..channels {
            let at = (frame * channels + ch) * WIDTH;
            let mut acc = 0.0f64;
            for source in sources.clone() {
                let source = as_source(&source);
                let bytes = &source.data[at..at + WIDTH];
                let sample = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                acc += f64::from(sample) * (ramp_gain(source, frame, frames) as f64 / unity);
            }
            let mixed = acc.clamp(-1.0, 1.0) as f32;
            dst[at..at + WIDTH].copy_from_slice(&mixed.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn s16(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn to_s16(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn test_no_sources_is_silence() {
        let mut dst = vec![0xFF; 8];
        mix_into(&mut dst, std::iter::empty::<MixSource<'_>>(), SampleFormat::S16Le, 2).unwrap();
        assert!(is_silent(&dst, SampleFormat::S16Le));

        let mut dst = vec![0u8; 4];
        mix_into(&mut dst, std::iter::empty::<MixSource<'_>>(), SampleFormat::U8, 1).unwrap();
        assert_eq!(dst, vec![0x80; 4]);
    }

    #[test]
    fn test_sum_and_saturate_s16() {
        let a = s16(&[16000, 30000, -30000, 100]);
        let b = s16(&[16000, 30000, -30000, -100]);
        let mut dst = vec![0u8; a.len()];
        mix_into(&mut dst, &[MixSource::new(&a), MixSource::new(&b)], SampleFormat::S16Le, 2)
            .unwrap();
        assert_eq!(to_s16(&dst), vec![32000, 32767, -32768, 0]);
    }

    #[test]
    fn test_silence_plus_signal_is_signal() {
        let signal = s16(&[1, -2, 300, -4000, 32767, -32768]);
        let silence = vec![0u8; signal.len()];
        let mut dst = vec![0u8; signal.len()];
        mix_into(
            &mut dst,
            &[MixSource::new(&silence), MixSource::new(&signal)],
            SampleFormat::S16Le,
            2,
        )
        .unwrap();
        assert_eq!(dst, signal);
    }

    #[test]
    fn test_muted_source_ignored() {
        let loud = s16(&[20000, 20000]);
        let signal = s16(&[5, 6]);
        let mut dst = vec![0u8; 4];
        let muted = MixSource {
            muted: true,
            ..MixSource::new(&loud)
        };
        mix_into(&mut dst, &[muted, MixSource::new(&signal)], SampleFormat::S16Le, 1).unwrap();
        assert_eq!(dst, signal);
    }

    #[test]
    fn test_mix_from_borrowed_parts() {
        let spans = [s16(&[100, 200]), s16(&[1000, 2000]), s16(&[7, 7])];
        let volumes = [
            (UNITY_VOLUME, UNITY_VOLUME, false),
            (UNITY_VOLUME / 2, UNITY_VOLUME / 2, false),
            (UNITY_VOLUME, UNITY_VOLUME, true),
        ];
        let sources = volumes.iter().zip(&spans).map(|(&(start, end, muted), data)| MixSource {
            data,
            volume_start: start,
            volume_end: end,
            muted,
        });
        let mut dst = vec![0u8; 4];
        mix_into(&mut dst, sources, SampleFormat::S16Le, 1).unwrap();
        assert_eq!(to_s16(&dst), vec![600, 1200]);
    }

    #[test]
    fn test_half_volume() {
        let a = s16(&[1000, -1000]);
        let mut dst = vec![0u8; 4];
        let half = MixSource {
            volume_start: UNITY_VOLUME / 2,
            volume_end: UNITY_VOLUME / 2,
            ..MixSource::new(&a)
        };
        mix_into(&mut dst, &[half], SampleFormat::S16Le, 1).unwrap();
        assert_eq!(to_s16(&dst), vec![500, -500]);
    }

    #[test]
    fn test_volume_ramp() {
        let a = s16(&[1000, 1000, 1000]);
        let mut dst = vec![0u8; 6];
        let fade_in = MixSource {
            volume_start: 0,
            volume_end: UNITY_VOLUME,
            ..MixSource::new(&a)
        };
        mix_into(&mut dst, &[fade_in], SampleFormat::S16Le, 1).unwrap();
        assert_eq!(to_s16(&dst), vec![0, 500, 1000]);
    }

    #[test]
    fn test_s24_sign_extension() {
        // -1 and the 24-bit maximum.
        let a = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F];
        let b = [0x00, 0x00, 0x00, 0x02, 0x00, 0x00];
        let mut dst = [0u8; 6];
        mix_into(&mut dst, &[MixSource::new(&a), MixSource::new(&b)], SampleFormat::S24Le, 2)
            .unwrap();
        assert_eq!(dst, [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F]);
    }

    #[test]
    fn test_u8_mix() {
        let a = [0x80 + 10, 0x80 - 100];
        let b = [0x80 + 20, 0x80 - 100];
        let mut dst = [0u8; 2];
        mix_into(&mut dst, &[MixSource::new(&a), MixSource::new(&b)], SampleFormat::U8, 1).unwrap();
        assert_eq!(dst, [0x80 + 30, 0]);
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_f32_clamp() {
        let a: Vec<u8> = [0.75f32, -0.25].iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut dst = vec![0u8; 8];
        mix_into(&mut dst, &[MixSource::new(&a), MixSource::new(&a)], SampleFormat::F32Le, 2)
            .unwrap();
        let out: Vec<f32> = dst
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(out, vec![1.0, -0.5]);
    }

    #[test]
    fn test_rejects_partial_frames() {
        let mut dst = vec![0u8; 6];
        let err = mix_into(&mut dst, std::iter::empty::<MixSource<'_>>(), SampleFormat::S16Le, 2)
            .unwrap_err();
        assert!(err.is_invalid_param());

        let short = [0u8; 2];
        let mut dst = vec![0u8; 4];
        assert!(mix_into(&mut dst, &[MixSource::new(&short)], SampleFormat::S16Le, 2).is_err());
    }

    proptest! {
        #[test]
        fn prop_s16_sum_never_wraps(a in any::<i16>(), b in any::<i16>()) {
            let (sa, sb) = (s16(&[a]), s16(&[b]));
            let mut dst = vec![0u8; 2];
            mix_into(&mut dst, &[MixSource::new(&sa), MixSource::new(&sb)], SampleFormat::S16Le, 1)
                .unwrap();
            let expected = (i32::from(a) + i32::from(b)).clamp(-32768, 32767);
            prop_assert_eq!(i32::from(to_s16(&dst)[0]), expected);
        }

        #[test]
        fn prop_silence_is_identity(samples in proptest::collection::vec(any::<i16>(), 1..64)) {
            let signal = s16(&samples);
            let silence = vec![0u8; signal.len()];
            let mut dst = vec![0u8; signal.len()];
            mix_into(
                &mut dst,
                &[MixSource::new(&signal), MixSource::new(&silence)],
                SampleFormat::S16Le,
                1,
            )
            .unwrap();
            prop_assert_eq!(dst, signal);
        }
    }
}
