/*!
    the printer's side of the serial line, to exercise a [zimcart::Cartridge] from async tests

    [link] creates a connected pair: a [Reader] sending commands the way the printer does, and a [Wire] to give to [zimcart::Cartridge::run]
*/

use core::convert::Infallible;
use std::time::Duration;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::Instant,
    };
use log::*;

use zimcart::{
    dispatch::{Function, PAGE_SIZE, FIRST_PAGE},
    platform::Clock,
    receiver::SYNC,
    record::RECORD_SIZE,
    response::{ESCAPE, OVERHEAD},
    };


/// delay after which a missing reply is considered never coming
pub const SILENCE: Duration = Duration::from_millis(200);

/// create a serial line between a reader and a cartridge
pub fn link() -> (Reader, Wire) {
    let (to_tag, from_reader) = mpsc::unbounded_channel();
    let (to_reader, from_tag) = mpsc::unbounded_channel();
    (
        Reader {to_tag, from_tag, pending: None},
        Wire {rx: from_reader, tx: to_reader},
    )
}

/// cartridge end of the serial line, ends once the reader is dropped
pub struct Wire {
    rx: UnboundedReceiver<u8>,
    tx: UnboundedSender<u8>,
}
impl embedded_io_async::ErrorType for Wire {
    type Error = Infallible;
}
impl embedded_io_async::Read for Wire {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Infallible> {
        let Some(first) = buf.first_mut()
            else {return Ok(0)};
        match self.rx.recv().await {
            Some(byte) => {
                *first = byte;
                Ok(1)
            },
            None => Ok(0),
        }
    }
}
impl embedded_io_async::Write for Wire {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Infallible> {
        for &byte in buf {
            // the reader may have hung up already, the bytes are lost like on a real line
            let _ = self.tx.send(byte);
        }
        Ok(buf.len())
    }
    async fn flush(&mut self) -> Result<(), Infallible> {Ok(())}
}

/// milliseconds since creation, following tokio's clock so paused tests stay deterministic
pub struct Uptime(Instant);
impl Uptime {
    pub fn new() -> Self {Self(Instant::now())}
}
impl Default for Uptime {
    fn default() -> Self {Self::new()}
}
impl Clock for Uptime {
    fn now_ms(&self) -> u32 {
        self.0.elapsed().as_millis() as u32
    }
}

/// reply decoded by the reader
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub address: u16,
    pub function: u16,
    pub status: u8,
    /// payload with escape bytes removed
    pub payload: Vec<u8>,
    /// value of the length field
    pub announced: u16,
    /// bytes actually received for this reply
    pub size: usize,
}

/// printer end of the serial line
pub struct Reader {
    to_tag: UnboundedSender<u8>,
    from_tag: UnboundedReceiver<u8>,
    /// byte read ahead while looking for an escape
    pending: Option<u8>,
}

impl Reader {
    /// send raw bytes, nothing checks they form a frame
    pub fn send_raw(&self, bytes: &[u8]) {
        for &byte in bytes {
            self.to_tag.send(byte).expect("cartridge hung up");
        }
    }
    /// send a command frame
    pub fn send(&self, address: u16, function: u16, payload: &[u8]) {
        self.send_raw(&frame(address, function, payload));
    }
    /// send a command and wait for its reply, which must be a success for the same command
    pub async fn command(&mut self, function: Function, payload: &[u8]) -> Vec<u8> {
        let function = u16::from(function);
        self.send(0, function, payload);
        let reply = self.reply().await;
        assert_eq!(reply.function, function, "reply to another command");
        assert_eq!(reply.status, 0, "command failed");
        reply.payload
    }
    /// send a command that gets no reply, and check none comes
    pub async fn notify(&mut self, function: Function, payload: &[u8]) {
        self.send(0, function.into(), payload);
        self.silence().await;
    }
    /// check nothing is received for a while
    pub async fn silence(&mut self) {
        assert!(self.pending.is_none(), "unexpected byte {:?}", self.pending);
        if let Ok(byte) = tokio::time::timeout(SILENCE, self.from_tag.recv()).await {
            panic!("unexpected byte {:?}", byte);
        }
    }

    /// discovery sequence the printer runs before touching a cartridge, returns the tag id
    pub async fn discover(&mut self) -> u16 {
        assert!(self.command(Function::InitPort, &[]).await.is_empty());
        self.notify(Function::SetAntennaStatus, &[1]).await;
        assert_eq!(self.command(Function::Request, &[0x26]).await, [0x44, 0x00]);
        let answer = self.command(Function::AntiCollision, &[0x93]).await;
        assert_eq!(answer.len(), 4);
        assert_eq!(answer[.. 2], [0x88, 0x04]);
        let id = u16::from_be_bytes([answer[2], answer[3]]);
        assert_eq!(self.command(Function::Select, &answer[2 ..]).await, [0x04]);
        debug!("discovered tag {:#06x}", id);
        id
    }
    /// read the whole record image
    pub async fn read_record(&mut self) -> [u8; RECORD_SIZE] {
        let image = self.command(Function::ReadData, &[FIRST_PAGE]).await;
        image.try_into().expect("record image has wrong size")
    }
    /// write the whole record image, page by page in order
    pub async fn write_record(&mut self, image: &[u8; RECORD_SIZE]) {
        for (page, data) in (FIRST_PAGE ..).zip(image.chunks(PAGE_SIZE)) {
            let mut payload = vec![page];
            payload.extend_from_slice(data);
            assert!(self.command(Function::WriteData, &payload).await.is_empty());
        }
    }

    /// receive the next reply frame, checking its framing and checksum
    pub async fn reply(&mut self) -> Reply {
        let sync = [self.byte().await, self.byte().await];
        assert_eq!(sync, SYNC, "reply does not start with sync bytes");
        let announced = u16::from_le_bytes([self.byte().await, self.byte().await]);
        let mut header = [0; 5];
        for byte in &mut header {
            *byte = self.byte().await;
        }
        let mut size = sync.len() + 2 + header.len();
        let mut xor = header.iter().fold(0, |acc, byte| acc ^ byte);

        let expected = usize::from(announced.checked_sub(OVERHEAD).expect("reply length too short"));
        let mut payload = Vec::with_capacity(expected);
        while payload.len() < expected {
            let byte = self.byte().await;
            size += 1;
            if byte == ESCAPE {
                let next = self.byte().await;
                if next == SYNC[0] {
                    size += 1;
                    xor ^= next;
                    payload.push(next);
                    continue;
                }
                self.pending = Some(next);
            }
            xor ^= byte;
            payload.push(byte);
        }
        let checksum = self.byte().await;
        size += 1;
        assert_eq!(checksum, xor, "reply checksum mismatch");

        let reply = Reply {
            address: u16::from_le_bytes([header[0], header[1]]),
            function: u16::from_le_bytes([header[2], header[3]]),
            status: header[4],
            payload,
            announced,
            size,
        };
        trace!("reply {:x?}", reply);
        reply
    }

    async fn byte(&mut self) -> u8 {
        if let Some(byte) = self.pending.take()
            {return byte}
        self.from_tag.recv().await.expect("cartridge hung up")
    }
}

/// command frame as the printer sends it
pub fn frame(address: u16, function: u16, payload: &[u8]) -> Vec<u8> {
    let length = u16::try_from(payload.len()).expect("payload too long for a frame") + zimcart::receiver::OVERHEAD;
    let mut frame = Vec::from(SYNC);
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&address.to_le_bytes());
    frame.extend_from_slice(&function.to_le_bytes());
    frame.extend_from_slice(payload);
    frame.push(frame[4 ..].iter().fold(0, |acc, byte| acc ^ byte));
    frame
}
