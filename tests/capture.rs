use pretty_assertions::assert_eq;
use ptee::tracer::CAPTURE_LIMIT;
use ptee::CapturedOutput;

mod support;
use support::*;

const BUF: u64 = 0x5555_0000_2003;

#[test]
fn test_tail_word_is_trimmed() {
    let mem = FakeMemory::new(BUF, &b"hello, world!"[..]);
    let output = CapturedOutput::read(&mem, BUF, 13);

    // Only the bytes in the window are kept, never the padding past it.
    assert_eq!(output.as_bytes(), b"hello, world!");
    assert!(!output.as_bytes().contains(&GARBAGE));
    assert_eq!(mem.peeks(), 2);
}

#[test]
fn test_empty_window_peeks_nothing() {
    let mem = FakeMemory::new(BUF, &b"abc"[..]);
    let output = CapturedOutput::read(&mem, BUF, 0);

    assert!(output.is_empty());
    assert_eq!(mem.peeks(), 0);
}

#[test]
fn test_window_is_clamped() {
    let mem = FakeMemory::new(BUF, vec![b'z'; CAPTURE_LIMIT * 2]);
    let output = CapturedOutput::read(&mem, BUF, CAPTURE_LIMIT * 2);

    assert_eq!(output.len(), CAPTURE_LIMIT);
    assert_eq!(mem.peeks(), CAPTURE_LIMIT / 8);
}

#[test]
fn test_fault_truncates_at_word_boundary() {
    for words in 0..4u64 {
        let mem = FakeMemory::new(BUF, vec![b'q'; 64]).fault_at(BUF + 8 * words);
        let output = CapturedOutput::read(&mem, BUF, 30);

        assert_eq!(output.len() as u64, 8 * words);
        assert_eq!(mem.peeks() as u64, words + 1);
    }
}

#[test]
fn test_unmapped_buffer_captures_nothing() {
    let mem = FakeMemory::new(BUF, &b"abc"[..]);
    let output = CapturedOutput::read(&mem, 0x10, 3);

    assert!(output.is_empty());
    assert_eq!(mem.peeks(), 1);
}

#[test]
fn test_address_overflow_stops_capture() {
    let mem = FakeMemory::new(BUF, &b"abc"[..]);
    let output = CapturedOutput::read(&mem, u64::MAX - 3, 16);

    // The first word faults. Nothing wraps around to low addresses.
    assert!(output.is_empty());
    assert!(mem.peeks() <= 1);
}
