//! Keyboard input queue
//!
//! IRQ1 pushes translated bytes into a bounded queue; `read(0, ..)` pops
//! them. Only the plain set-1 scancode map is handled here; full PS/2
//! decoding and line editing live in user space.

use spin::Mutex;

const QUEUE_SIZE: usize = 256;

/// Set-1 scancode to ASCII, unshifted
static KEYMAP: [u8; 58] = [
    0, 27, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-', b'=', 8, b'\t',
    b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o', b'p', b'[', b']', b'\n', 0, b'a', b's',
    b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', b'\'', b'`', 0, b'\\', b'z', b'x', b'c', b'v',
    b'b', b'n', b'm', b',', b'.', b'/', 0, b'*', 0, b' ',
];

/// Set-1 scancode to ASCII, shifted
static KEYMAP_SHIFT: [u8; 58] = [
    0, 27, b'!', b'@', b'#', b'$', b'%', b'^', b'&', b'*', b'(', b')', b'_', b'+', 8, b'\t',
    b'Q', b'W', b'E', b'R', b'T', b'Y', b'U', b'I', b'O', b'P', b'{', b'}', b'\n', 0, b'A', b'S',
    b'D', b'F', b'G', b'H', b'J', b'K', b'L', b':', b'"', b'~', 0, b'|', b'Z', b'X', b'C', b'V',
    b'B', b'N', b'M', b'<', b'>', b'?', 0, b'*', 0, b' ',
];

struct InputQueue {
    buf: [u8; QUEUE_SIZE],
    head: usize,
    tail: usize,
    len: usize,
    shift: bool,
    /// Process blocked on an empty queue
    waiter: Option<u32>,
}

impl InputQueue {
    const fn new() -> Self {
        Self {
            buf: [0; QUEUE_SIZE],
            head: 0,
            tail: 0,
            len: 0,
            shift: false,
            waiter: None,
        }
    }

    fn push(&mut self, b: u8) {
        if self.len == QUEUE_SIZE {
            return; // queue full, drop
        }
        self.buf[self.tail] = b;
        self.tail = (self.tail + 1) % QUEUE_SIZE;
        self.len += 1;
    }

    fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let b = self.buf[self.head];
        self.head = (self.head + 1) % QUEUE_SIZE;
        self.len -= 1;
        Some(b)
    }
}

static QUEUE: Mutex<InputQueue> = Mutex::new(InputQueue::new());

/// Translate and enqueue a raw scancode. Called from the IRQ1 handler.
pub fn handle_scancode(scancode: u8) {
    let mut q = QUEUE.lock();

    match scancode {
        0x2A | 0x36 => {
            q.shift = true;
            return;
        }
        0xAA | 0xB6 => {
            q.shift = false;
            return;
        }
        _ => {}
    }

    // Key releases carry bit 7
    if scancode & 0x80 != 0 {
        return;
    }

    let idx = scancode as usize;
    if idx >= KEYMAP.len() {
        return;
    }
    let ch = if q.shift { KEYMAP_SHIFT[idx] } else { KEYMAP[idx] };
    if ch == 0 {
        return;
    }

    q.push(ch);

    if let Some(pid) = q.waiter.take() {
        crate::process::wake(pid);
    }
}

/// Pop one byte if available. The queue lock is shared with the IRQ
/// handler, so it is only taken with interrupts masked.
pub fn pop_byte() -> Option<u8> {
    crate::interrupts::without_interrupts(|| QUEUE.lock().pop())
}

/// Register the calling process as the queue's waiter. Returns false if a
/// byte arrived in the meantime (caller should retry the pop).
pub fn register_waiter(pid: u32) -> bool {
    crate::interrupts::without_interrupts(|| {
        let mut q = QUEUE.lock();
        if q.len > 0 {
            return false;
        }
        q.waiter = Some(pid);
        true
    })
}
