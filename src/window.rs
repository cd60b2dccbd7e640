use std::collections::VecDeque;
use bytes::Bytes;
use tracing::trace;
use crate::frame::{Frame, FrameFlags};
use crate::session_key::Route;

/// Number of frames a window can hold, on both the sending and the receiving side
pub const WINDOW_SIZE: u32 = 16;

/// Fixed-capacity buffer of in-flight frames, indexed by sequence number.
///
/// Slot `i` holds the frame with sequence number `start_sequence + i`. Slots are only ever
///  trimmed from the front, so `start_sequence` is the oldest sequence number still resident.
#[derive(Debug)]
pub struct Window {
    slots: VecDeque<Option<Frame>>,
    start_sequence: u32,
    /// the first sequence number that will never legitimately appear - once set, it does not move
    stop_sequence: Option<u32>,
}

impl Default for Window {
    fn default() -> Self {
        Self::new()
    }
}

impl Window {
    pub fn new() -> Window {
        Window {
            slots: VecDeque::with_capacity(WINDOW_SIZE as usize),
            start_sequence: 0,
            stop_sequence: None,
        }
    }

    pub fn start_sequence(&self) -> u32 {
        self.start_sequence
    }

    pub fn stop_sequence(&self) -> Option<u32> {
        self.stop_sequence
    }

    /// Returns `true` if the frame is in (or below) the window. Frames below the window were
    ///  consumed before and are accepted as a no-op so they get acknowledged again.
    pub fn add(&mut self, frame: Frame) -> bool {
        if frame.sequence < self.start_sequence {
            trace!("frame #{} is below the window start #{} - already consumed", frame.sequence, self.start_sequence);
            return true;
        }

        let offset = frame.sequence - self.start_sequence;
        if offset >= WINDOW_SIZE {
            return false;
        }
        if let Some(stop) = self.stop_sequence {
            if frame.sequence >= stop {
                return false;
            }
        }

        let offset = offset as usize;
        while self.slots.len() <= offset {
            self.slots.push_back(None);
        }
        if self.slots[offset].is_none() {
            self.slots[offset] = Some(frame);
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() == WINDOW_SIZE as usize
    }

    /// all resident frames, in sequence order
    pub fn frames(&self) -> Vec<Frame> {
        self.slots.iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Empties the window and forgets the stop sequence. The window position is retained.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.stop_sequence = None;
    }

    /// First call wins: the end of the stream, once announced, cannot move
    pub fn stop_at(&mut self, sequence: u32) {
        if self.stop_sequence.is_none() {
            self.stop_sequence = Some(sequence);
        }
    }

    fn end_sequence(&self) -> u32 {
        self.start_sequence + self.slots.len() as u32
    }
}

/// The sending side: sequence numbers are assigned here, strictly increasing and without gaps.
#[derive(Debug)]
pub struct SendWindow {
    window: Window,
    route: Route,
    /// sequence number for the next outgoing data frame
    next_sequence: u32,
    stop_frame: Option<Frame>,
}

impl SendWindow {
    pub fn new(route: Route) -> SendWindow {
        SendWindow {
            window: Window::new(),
            route,
            next_sequence: 0,
            stop_frame: None,
        }
    }

    pub fn start_sequence(&self) -> u32 {
        self.window.start_sequence()
    }

    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    pub fn stop_sequence(&self) -> Option<u32> {
        self.window.stop_sequence()
    }

    /// Wraps the bytes in a data frame with the next sequence number. Returns the frame for
    ///  transmission, or `None` if the window has no room for it.
    pub fn add(&mut self, payload: Bytes) -> Option<Frame> {
        let frame = self.route.frame(FrameFlags::empty(), self.next_sequence, payload);
        if self.window.is_full() || !self.window.add(frame.clone()) {
            return None;
        }
        self.next_sequence += 1;
        Some(frame)
    }

    pub fn acked(&mut self, sequence: u32) {
        let w = &mut self.window;
        if sequence < w.start_sequence || sequence >= w.end_sequence() {
            trace!("ignoring ack #{} outside of the send window [{}, {})", sequence, w.start_sequence, w.end_sequence());
            return;
        }
        if let Some(stop) = w.stop_sequence {
            if sequence >= stop {
                trace!("ignoring ack #{} at or beyond the stop sequence #{}", sequence, stop);
                return;
            }
        }

        w.slots[(sequence - w.start_sequence) as usize] = None;

        // sequence numbers are assigned without gaps, so only the front can become free
        while let Some(None) = w.slots.front() {
            w.slots.pop_front();
            w.start_sequence += 1;
        }
    }

    /// The frame announcing the final sequence number this side will ever send. Its sequence
    ///  number is computed on the first call - the window end plus one frame per (partial)
    ///  chunk still waiting in the outbound buffer - and fixed from then on.
    pub fn stop_frame(&mut self, buffered_len: usize, max_payload_len: usize) -> Frame {
        if let Some(frame) = &self.stop_frame {
            return frame.clone();
        }

        let pending_chunks = buffered_len.div_ceil(max_payload_len) as u32;
        let stop_sequence = self.window.end_sequence() + pending_chunks;
        self.window.stop_at(stop_sequence);

        let frame = self.route.control(FrameFlags::STP, stop_sequence);
        self.stop_frame = Some(frame.clone());
        frame
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.window.is_full()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.window.frames()
    }

    pub fn clear(&mut self) {
        self.window.clear();
        self.window.start_sequence = self.next_sequence;
    }
}

/// The receiving side: frames are released to the application strictly in order.
#[derive(Debug, Default)]
pub struct ReceiveWindow {
    window: Window,
}

impl ReceiveWindow {
    pub fn new() -> ReceiveWindow {
        ReceiveWindow {
            window: Window::new(),
        }
    }

    pub fn start_sequence(&self) -> u32 {
        self.window.start_sequence()
    }

    pub fn stop_sequence(&self) -> Option<u32> {
        self.window.stop_sequence()
    }

    pub fn add(&mut self, frame: Frame) -> bool {
        self.window.add(frame)
    }

    /// Pops the head frame if it has arrived. A hole at the head blocks delivery even if later
    ///  frames are present.
    pub fn remove(&mut self) -> Option<Frame> {
        if !matches!(self.window.slots.front(), Some(Some(_))) {
            return None;
        }
        self.window.start_sequence += 1;
        self.window.slots.pop_front().flatten()
    }

    pub fn stop_at(&mut self, sequence: u32) {
        self.window.stop_at(sequence)
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn clear(&mut self) {
        self.window.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_key::SessionKey;
    use rstest::rstest;

    fn route() -> Route {
        Route::new(1, SessionKey::new(50, 2, 7))
    }

    fn data(sequence: u32) -> Frame {
        route().frame(FrameFlags::empty(), sequence, Bytes::from(vec![sequence as u8]))
    }

    fn window_at(start: u32, stop: Option<u32>) -> Window {
        let mut window = Window::new();
        window.start_sequence = start;
        if let Some(stop) = stop {
            window.stop_at(stop);
        }
        window
    }

    #[rstest]
    #[case::at_start(4, None, 4, true, 1)]
    #[case::inside(4, None, 10, true, 7)]
    #[case::last_slot(4, None, 19, true, 16)]
    #[case::one_past_capacity(4, None, 20, false, 0)]
    #[case::far_beyond(4, None, 1000, false, 0)]
    #[case::below_start(4, None, 3, true, 0)]
    #[case::zero_below_start(4, None, 0, true, 0)]
    #[case::before_stop(4, Some(8), 7, true, 4)]
    #[case::at_stop(4, Some(8), 8, false, 0)]
    #[case::beyond_stop(4, Some(8), 9, false, 0)]
    fn test_add(#[case] start: u32, #[case] stop: Option<u32>, #[case] sequence: u32, #[case] expected: bool, #[case] expected_len: usize) {
        let mut window = window_at(start, stop);
        assert_eq!(window.add(data(sequence)), expected);
        assert_eq!(window.slots.len(), expected_len);
        assert_eq!(window.start_sequence(), start);
    }

    #[test]
    fn test_add_duplicate_keeps_first() {
        let mut window = Window::new();
        assert!(window.add(data(1)));

        let mut duplicate = data(1);
        duplicate.payload = Bytes::from_static(b"other");
        assert!(window.add(duplicate));

        assert_eq!(window.frames(), vec![data(1)]);
        assert!(!window.is_empty());
    }

    #[test]
    fn test_stop_at_first_call_wins() {
        let mut window = Window::new();
        window.stop_at(5);
        window.stop_at(3);
        window.stop_at(9);
        assert_eq!(window.stop_sequence(), Some(5));
    }

    #[test]
    fn test_clear() {
        let mut window = window_at(3, Some(10));
        window.add(data(4));

        window.clear();
        assert!(window.is_empty());
        assert_eq!(window.stop_sequence(), None);
        assert_eq!(window.start_sequence(), 3);
    }

    #[test]
    fn test_send_window_assigns_sequence_numbers() {
        let mut window = SendWindow::new(route());

        for i in 0..WINDOW_SIZE {
            let frame = window.add(Bytes::from(vec![i as u8])).unwrap();
            assert_eq!(frame, data(i));
        }
        assert!(window.is_full());
        assert_eq!(window.add(Bytes::from_static(b"x")), None);
        assert_eq!(window.next_sequence(), WINDOW_SIZE);
    }

    #[rstest]
    #[case::front(vec![0], 1, 4)]
    #[case::middle(vec![2], 0, 4)]
    #[case::middle_then_front(vec![2, 1, 0], 3, 2)]
    #[case::all(vec![3, 1, 4, 0, 2], 5, 0)]
    #[case::duplicate(vec![0, 0], 1, 4)]
    #[case::below_window(vec![0, 0, 1], 2, 3)]
    #[case::beyond_window(vec![5, 17], 0, 5)]
    fn test_send_window_acked(#[case] acks: Vec<u32>, #[case] expected_start: u32, #[case] expected_resident: usize) {
        let mut window = SendWindow::new(route());
        for i in 0..5u8 {
            window.add(Bytes::from(vec![i])).unwrap();
        }

        for ack in acks {
            window.acked(ack);
        }

        assert_eq!(window.start_sequence(), expected_start);
        assert_eq!(window.frames().len(), expected_resident);
    }

    #[test]
    fn test_send_window_sliding_frees_room() {
        let mut window = SendWindow::new(route());
        for i in 0..WINDOW_SIZE {
            window.add(Bytes::from(vec![i as u8])).unwrap();
        }

        window.acked(1);
        assert!(window.is_full());
        window.acked(0);
        assert!(!window.is_full());

        assert_eq!(window.add(Bytes::from_static(&[16])).unwrap().sequence, 16);
        assert_eq!(window.add(Bytes::from_static(&[17])).unwrap().sequence, 17);
        assert!(window.is_full());
    }

    #[rstest]
    #[case::empty_window_empty_buffer(0, 0, 1, 0)]
    #[case::empty_window_exact_chunks(0, 6, 3, 2)]
    #[case::empty_window_partial_chunk(0, 7, 3, 3)]
    #[case::in_flight_only(3, 0, 3, 3)]
    #[case::in_flight_and_buffered(3, 1, 20, 4)]
    fn test_stop_frame(#[case] in_flight: u8, #[case] buffered: usize, #[case] max_payload: usize, #[case] expected: u32) {
        let mut window = SendWindow::new(route());
        for i in 0..in_flight {
            window.add(Bytes::from(vec![i])).unwrap();
        }

        let stop = window.stop_frame(buffered, max_payload);
        assert_eq!(stop, route().control(FrameFlags::STP, expected));
        assert_eq!(window.stop_sequence(), Some(expected));
    }

    #[test]
    fn test_stop_frame_is_fixed() {
        let mut window = SendWindow::new(route());
        window.add(Bytes::from_static(&[1])).unwrap();

        let first = window.stop_frame(10, 1);
        assert_eq!(first.sequence, 11);

        window.acked(0);
        assert_eq!(window.stop_frame(0, 1), first);
        assert_eq!(window.stop_frame(100, 1), first);
    }

    #[test]
    fn test_send_window_ack_at_stop_ignored() {
        let mut window = SendWindow::new(route());
        for i in 0..3u8 {
            window.add(Bytes::from(vec![i])).unwrap();
        }
        window.window.stop_at(1);

        window.acked(2);
        window.acked(1);
        assert_eq!(window.frames().len(), 3);

        window.acked(0);
        assert_eq!(window.start_sequence(), 1);
    }

    #[test]
    fn test_send_window_clear() {
        let mut window = SendWindow::new(route());
        for i in 0..3u8 {
            window.add(Bytes::from(vec![i])).unwrap();
        }

        window.clear();
        assert!(window.is_empty());
        assert_eq!(window.start_sequence(), 3);
        assert_eq!(window.add(Bytes::from_static(&[3])).unwrap().sequence, 3);
    }

    #[test]
    fn test_receive_window_in_order_release() {
        let mut window = ReceiveWindow::new();
        assert!(window.add(data(1)));
        assert!(window.add(data(2)));

        // hole at the head blocks delivery
        assert_eq!(window.remove(), None);
        assert!(!window.is_empty());

        assert!(window.add(data(0)));
        assert_eq!(window.remove(), Some(data(0)));
        assert_eq!(window.remove(), Some(data(1)));
        assert_eq!(window.remove(), Some(data(2)));
        assert_eq!(window.remove(), None);
        assert!(window.is_empty());
        assert_eq!(window.start_sequence(), 3);

        // retransmission of a consumed frame is accepted but not stored
        assert!(window.add(data(1)));
        assert!(window.is_empty());
    }

    #[test]
    fn test_receive_window_stop() {
        let mut window = ReceiveWindow::new();
        window.stop_at(2);
        window.stop_at(7);

        assert!(window.add(data(1)));
        assert!(!window.add(data(2)));
        assert!(!window.add(data(5)));
        assert_eq!(window.stop_sequence(), Some(2));
    }
}
