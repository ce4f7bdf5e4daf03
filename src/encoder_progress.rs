//! Encoder progress stream parsing.
//!
//! ffmpeg's `-progress` output is a line-oriented `key=value` stream. Only the
//! `frame=<n>` lines are used; everything else is ignored.

use std::io::{self, BufRead};
use std::time::Instant;

use crate::progress::{ProgressLine, ProgressSample, ProgressSink};

/// Frame number from a `frame=<integer>` line, whitespace trimmed.
pub fn parse_frame_line(line: &str) -> Option<usize> {
    let value = line.trim().strip_prefix("frame=")?;
    value.trim().parse().ok()
}

/// Consume `reader` to the end, redrawing `sink` on every frame line.
///
/// Reading never stalls the encoder: lines are drained as fast as they are
/// produced and only rendered. Returns the last frame number seen.
pub fn track<R: BufRead>(mut reader: R, total_frames: usize, sink: &mut dyn ProgressSink) -> io::Result<usize> {
    let start = Instant::now();
    let mut last_frame = 0;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        if let Some(frame) = parse_frame_line(&line) {
            last_frame = frame;
            let sample = ProgressSample::new(start.elapsed(), frame, total_frames);
            sink.render(&ProgressLine::frames(sample));
        }
    }

    sink.finish();
    Ok(last_frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressUnit;
    use std::io::Cursor;

    #[derive(Default)]
    struct RecordingSink {
        lines: Vec<ProgressLine>,
        finished: bool,
    }

    impl ProgressSink for RecordingSink {
        fn render(&mut self, line: &ProgressLine) {
            self.lines.push(*line);
        }

        fn finish(&mut self) {
            self.finished = true;
        }
    }

    #[test]
    fn test_parse_frame_line() {
        assert_eq!(parse_frame_line("frame=42"), Some(42));
        assert_eq!(parse_frame_line("frame=  42 \r\n"), Some(42));
        assert_eq!(parse_frame_line("fps=24.0"), None);
        assert_eq!(parse_frame_line("frame="), None);
        assert_eq!(parse_frame_line("frame=  12 fps=3.0 q=28.0"), None);
        assert_eq!(parse_frame_line("out_time=00:00:01.000000"), None);
    }

    #[test]
    fn test_track_renders_only_frame_lines() {
        let stream = "frame=1\nfps=0.0\nstream_0_0_q=28.0\nframe=5\nprogress=continue\nframe=10\nprogress=end\n";
        let mut sink = RecordingSink::default();

        let last = track(Cursor::new(stream), 10, &mut sink).unwrap();

        assert_eq!(last, 10);
        assert!(sink.finished);
        let frames: Vec<usize> = sink.lines.iter().map(|l| l.sample.done).collect();
        assert_eq!(frames, vec![1, 5, 10]);
        assert!(sink.lines.iter().all(|l| l.unit == ProgressUnit::Frames));
        assert_eq!(sink.lines.last().unwrap().sample.percent(), 100.0);
    }

    #[test]
    fn test_track_tolerates_invalid_utf8() {
        let mut stream = b"frame=3\n".to_vec();
        stream.extend_from_slice(&[0xff, 0xfe, b'\n']);
        stream.extend_from_slice(b"frame=4");
        let mut sink = RecordingSink::default();

        assert_eq!(track(Cursor::new(stream), 4, &mut sink).unwrap(), 4);
    }
}
