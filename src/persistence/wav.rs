use anyhow::{Context, Result};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Fixed header prepended to every stored recording: RIFF preamble, an
/// 18-byte `fmt ` chunk (A-law needs the cbSize word) and the `data` chunk
/// header. 46 bytes total.
pub const WAV_HEADER_LEN: usize = 46;

pub const SAMPLE_RATE: u32 = 8000;
pub const BITS_PER_SAMPLE: u16 = 8;
const FORMAT_TAG_ALAW: u16 = 6;

/// Build the 46-byte A-law WAV header for `data_len` payload bytes.
/// Mono for simplex/group recordings, 2 channels with block-align 2 for
/// interleaved duplex recordings.
pub fn alaw_header(channels: u16, data_len: u32) -> [u8; WAV_HEADER_LEN] {
    let mut header = [0u8; WAV_HEADER_LEN];
    let byte_rate = SAMPLE_RATE * channels as u32;

    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&(data_len + WAV_HEADER_LEN as u32 - 8).to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&18u32.to_le_bytes());
    header[20..22].copy_from_slice(&FORMAT_TAG_ALAW.to_le_bytes());
    header[22..24].copy_from_slice(&channels.to_le_bytes());
    header[24..28].copy_from_slice(&SAMPLE_RATE.to_le_bytes());
    header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    header[32..34].copy_from_slice(&channels.to_le_bytes()); // block align, 1 byte per sample
    header[34..36].copy_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
    header[36..38].copy_from_slice(&0u16.to_le_bytes()); // cbSize
    header[38..42].copy_from_slice(b"data");
    header[42..46].copy_from_slice(&data_len.to_le_bytes());
    header
}

/// Recording duration in seconds for `data_len` A-law bytes.
pub fn duration_seconds(data_len: u64, channels: u16) -> f64 {
    let byte_rate = SAMPLE_RATE as u64 * channels as u64 * (BITS_PER_SAMPLE as u64 / 8);
    data_len as f64 / byte_rate as f64
}

/// Render a duration as `H:M:S.mmm` for the database duration column.
pub fn format_duration(seconds: f64) -> String {
    let whole = seconds as u64;
    let hours = whole / 3600;
    let minutes = (whole % 3600) / 60;
    let secs = whole % 60;
    let millis = ((seconds - whole as f64) * 1000.0).round() as u64;
    format!("{}:{}:{}.{:03}", hours, minutes, secs, millis)
}

/// Append one A-law frame to a growing per-call WAV file, creating it with a
/// zero-length header on first use and patching the RIFF and data sizes in
/// place afterwards.
pub fn append_alaw_frame(path: &Path, frame: &[u8]) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .with_context(|| format!("open wav mirror {}", path.display()))?;
    if file.metadata()?.len() == 0 {
        file.write_all(&alaw_header(1, 0))?;
    }

    file.seek(SeekFrom::End(0))?;
    file.write_all(frame)?;

    let mut header = [0u8; WAV_HEADER_LEN];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header)?;
    let riff_size = u32::from_le_bytes(header[4..8].try_into().unwrap()) + frame.len() as u32;
    let data_size = u32::from_le_bytes(header[42..46].try_into().unwrap()) + frame.len() as u32;
    header[4..8].copy_from_slice(&riff_size.to_le_bytes());
    header[42..46].copy_from_slice(&data_size.to_le_bytes());
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_header_arithmetic() {
        let data_len = 250 * 480u32;
        let header = alaw_header(1, data_len);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(
            u32::from_le_bytes(header[4..8].try_into().unwrap()),
            data_len + 46 - 8
        );
        assert_eq!(&header[8..12], b"WAVE");
        assert_eq!(u16::from_le_bytes(header[20..22].try_into().unwrap()), 6);
        assert_eq!(u16::from_le_bytes(header[22..24].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(header[24..28].try_into().unwrap()), 8000);
        assert_eq!(u32::from_le_bytes(header[28..32].try_into().unwrap()), 8000);
        assert_eq!(u16::from_le_bytes(header[32..34].try_into().unwrap()), 1);
        assert_eq!(u16::from_le_bytes(header[34..36].try_into().unwrap()), 8);
        assert_eq!(&header[38..42], b"data");
        assert_eq!(
            u32::from_le_bytes(header[42..46].try_into().unwrap()),
            data_len
        );
    }

    #[test]
    fn stereo_header_doubles_the_rates() {
        let data_len = 100 * 960u32;
        let header = alaw_header(2, data_len);
        assert_eq!(u16::from_le_bytes(header[22..24].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(header[28..32].try_into().unwrap()), 16000);
        assert_eq!(u16::from_le_bytes(header[32..34].try_into().unwrap()), 2);
        assert_eq!(
            u32::from_le_bytes(header[4..8].try_into().unwrap()),
            data_len + 38
        );
    }

    #[test]
    fn duration_rendering() {
        // 250 mono frames = 120000 bytes = 15 s
        assert_eq!(duration_seconds(120_000, 1), 15.0);
        assert_eq!(format_duration(15.0), "0:0:15.000");
        // 16060 bytes mono = 2.0075 s
        assert_eq!(format_duration(duration_seconds(16_060, 1)), "0:0:2.008");
        assert_eq!(format_duration(3723.5), "1:2:3.500");
    }

    #[test]
    fn wav_mirror_grows_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voice_5.wav");
        append_alaw_frame(&path, &[0xd5; 480]).unwrap();
        append_alaw_frame(&path, &[0x55; 480]).unwrap();

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), WAV_HEADER_LEN + 960);
        assert_eq!(
            u32::from_le_bytes(contents[42..46].try_into().unwrap()),
            960
        );
        assert_eq!(
            u32::from_le_bytes(contents[4..8].try_into().unwrap()),
            960 + 38
        );
        assert!(contents[46..46 + 480].iter().all(|&b| b == 0xd5));
    }
}
