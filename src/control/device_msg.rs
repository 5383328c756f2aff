use crate::adb::AppInfo;
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Device message type bytes (server to client)
pub const MSG_TYPE_CLIPBOARD: u8 = 0;
pub const MSG_TYPE_ACK_CLIPBOARD: u8 = 1;
pub const MSG_TYPE_UHID_OUTPUT: u8 = 2;
pub const MSG_TYPE_APP_LIST: u8 = 3;

/// A message received from the device over the control socket
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    Clipboard { text: String },
    AckClipboard { sequence: u64 },
    UhidOutput { id: u16, data: Vec<u8> },
    AppList { apps: Vec<AppInfo> },
}

/// Parse one record from the front of `buf`. Returns the message (if the
/// record is meaningful) and the number of bytes consumed; 0 means the
/// record is incomplete and more data is needed. An unknown type byte
/// consumes the whole buffer: there is no way to resynchronize, so the
/// content is discarded.
pub fn parse_device_message(buf: &[u8]) -> (Option<DeviceMessage>, usize) {
    if buf.is_empty() {
        return (None, 0);
    }

    match buf[0] {
        MSG_TYPE_CLIPBOARD => parse_clipboard(buf),
        MSG_TYPE_ACK_CLIPBOARD => parse_ack_clipboard(buf),
        MSG_TYPE_UHID_OUTPUT => parse_uhid_output(buf),
        MSG_TYPE_APP_LIST => parse_app_list(buf),
        unknown => {
            warn!("Unknown device message type {}, discarding buffer", unknown);
            (None, buf.len())
        }
    }
}

/// CLIPBOARD: u32 length, then UTF-8 text (trailing NULs stripped)
fn parse_clipboard(buf: &[u8]) -> (Option<DeviceMessage>, usize) {
    if buf.len() < 5 {
        return (None, 0);
    }
    let text_len = u32::from_be_bytes(buf[1..5].try_into().unwrap()) as usize;
    if buf.len() < 5 + text_len {
        return (None, 0);
    }

    let mut text_bytes = &buf[5..5 + text_len];
    while let [head @ .., 0] = text_bytes {
        text_bytes = head;
    }
    let text = String::from_utf8_lossy(text_bytes).into_owned();

    (Some(DeviceMessage::Clipboard { text }), 5 + text_len)
}

/// ACK_CLIPBOARD: u64 sequence
fn parse_ack_clipboard(buf: &[u8]) -> (Option<DeviceMessage>, usize) {
    if buf.len() < 9 {
        return (None, 0);
    }
    let sequence = u64::from_be_bytes(buf[1..9].try_into().unwrap());
    (Some(DeviceMessage::AckClipboard { sequence }), 9)
}

/// UHID_OUTPUT: u16 id, u16 size, then payload
fn parse_uhid_output(buf: &[u8]) -> (Option<DeviceMessage>, usize) {
    if buf.len() < 5 {
        return (None, 0);
    }
    let id = u16::from_be_bytes(buf[1..3].try_into().unwrap());
    let size = u16::from_be_bytes(buf[3..5].try_into().unwrap()) as usize;
    if buf.len() < 5 + size {
        return (None, 0);
    }
    let data = buf[5..5 + size].to_vec();
    (Some(DeviceMessage::UhidOutput { id, data }), 5 + size)
}

/// APP_LIST: u16 count, then per app: u8 system, u16 nameLen, name,
/// u16 pkgLen, pkg
fn parse_app_list(buf: &[u8]) -> (Option<DeviceMessage>, usize) {
    if buf.len() < 3 {
        return (None, 0);
    }
    let count = u16::from_be_bytes(buf[1..3].try_into().unwrap()) as usize;
    let mut offset = 3;
    let mut apps = Vec::with_capacity(count);

    for _ in 0..count {
        if buf.len() < offset + 3 {
            return (None, 0);
        }
        let system = buf[offset] != 0;
        let name_len = u16::from_be_bytes(buf[offset + 1..offset + 3].try_into().unwrap()) as usize;
        offset += 3;

        if buf.len() < offset + name_len + 2 {
            return (None, 0);
        }
        let name = String::from_utf8_lossy(&buf[offset..offset + name_len]).into_owned();
        offset += name_len;

        let pkg_len = u16::from_be_bytes(buf[offset..offset + 2].try_into().unwrap()) as usize;
        offset += 2;

        if buf.len() < offset + pkg_len {
            return (None, 0);
        }
        let package = String::from_utf8_lossy(&buf[offset..offset + pkg_len]).into_owned();
        offset += pkg_len;

        apps.push(AppInfo {
            name,
            package,
            system,
        });
    }

    (Some(DeviceMessage::AppList { apps }), offset)
}

type Slot<T> = Mutex<Option<Box<dyn Fn(T) + Send>>>;

/// Callbacks invoked from the receiver task. Each slot may be replaced at
/// runtime (the app-list waiter installs a temporary one).
#[derive(Default)]
pub struct DeviceMessageCallbacks {
    on_clipboard: Slot<(String, u64)>,
    on_clipboard_ack: Slot<u64>,
    on_uhid_output: Slot<(u16, Vec<u8>)>,
    on_app_list: Slot<Vec<AppInfo>>,
}

impl DeviceMessageCallbacks {
    pub fn set_on_clipboard(&self, f: impl Fn((String, u64)) + Send + 'static) {
        *self.on_clipboard.lock() = Some(Box::new(f));
    }

    pub fn set_on_clipboard_ack(&self, f: impl Fn(u64) + Send + 'static) {
        *self.on_clipboard_ack.lock() = Some(Box::new(f));
    }

    pub fn set_on_uhid_output(&self, f: impl Fn((u16, Vec<u8>)) + Send + 'static) {
        *self.on_uhid_output.lock() = Some(Box::new(f));
    }

    pub fn set_on_app_list(&self, f: impl Fn(Vec<AppInfo>) + Send + 'static) {
        *self.on_app_list.lock() = Some(Box::new(f));
    }

    pub fn clear_on_app_list(&self) {
        *self.on_app_list.lock() = None;
    }

    fn dispatch(&self, msg: DeviceMessage) {
        match msg {
            DeviceMessage::Clipboard { text } => {
                info!("Device clipboard: {} chars", text.len());
                if let Some(f) = self.on_clipboard.lock().as_ref() {
                    f((text, 0));
                }
            }
            DeviceMessage::AckClipboard { sequence } => {
                debug!("Clipboard ACK for sequence {}", sequence);
                if let Some(f) = self.on_clipboard_ack.lock().as_ref() {
                    f(sequence);
                }
            }
            DeviceMessage::UhidOutput { id, data } => {
                debug!("UHID output: id={}, {} bytes", id, data.len());
                if let Some(f) = self.on_uhid_output.lock().as_ref() {
                    f((id, data));
                }
            }
            DeviceMessage::AppList { apps } => {
                info!("App list received: {} apps", apps.len());
                if let Some(f) = self.on_app_list.lock().as_ref() {
                    f(apps);
                }
            }
        }
    }
}

/// Receiver task for the control socket's read side. Keeps a growing
/// buffer, consumes as many complete records as possible per read, and
/// compacts the tail to the front.
pub struct DeviceMessageReceiver<R> {
    reader: R,
    callbacks: std::sync::Arc<DeviceMessageCallbacks>,
    shutdown: watch::Receiver<bool>,
}

impl<R: AsyncRead + Unpin> DeviceMessageReceiver<R> {
    pub fn new(
        reader: R,
        callbacks: std::sync::Arc<DeviceMessageCallbacks>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            reader,
            callbacks,
            shutdown,
        }
    }

    pub async fn run(mut self) -> std::io::Result<()> {
        info!("Device message receiver started");
        let mut buffer = BytesMut::with_capacity(4096);

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let read = tokio::select! {
                _ = self.shutdown.changed() => break,
                result = self.reader.read_buf(&mut buffer) => result,
            };

            match read {
                Ok(0) => {
                    info!("Control socket closed ({} bytes buffered)", buffer.len());
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if !*self.shutdown.borrow() {
                        error!("Receiver socket error: {}", e);
                        return Err(e);
                    }
                    break;
                }
            }

            while !buffer.is_empty() {
                let (msg, consumed) = parse_device_message(&buffer);
                if consumed == 0 {
                    break; // incomplete record, wait for more data
                }
                buffer.advance(consumed);
                if let Some(msg) = msg {
                    self.callbacks.dispatch(msg);
                }
            }
        }

        info!("Device message receiver stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn clipboard_record(text: &str) -> Vec<u8> {
        let mut buf = vec![MSG_TYPE_CLIPBOARD];
        buf.put_u32(text.len() as u32);
        buf.extend_from_slice(text.as_bytes());
        buf
    }

    #[test]
    fn test_parse_clipboard_strips_trailing_nuls() {
        let mut record = vec![MSG_TYPE_CLIPBOARD];
        record.put_u32(7);
        record.extend_from_slice(b"hello\x00\x00");

        let (msg, consumed) = parse_device_message(&record);
        assert_eq!(consumed, 12);
        assert_eq!(
            msg,
            Some(DeviceMessage::Clipboard {
                text: "hello".to_string()
            })
        );
    }

    #[test]
    fn test_parse_incomplete_returns_zero_consumed() {
        let record = clipboard_record("hello world");
        for cut in 0..record.len() {
            let (msg, consumed) = parse_device_message(&record[..cut]);
            assert_eq!(consumed, 0, "cut at {}", cut);
            assert_eq!(msg, None);
        }
    }

    #[test]
    fn test_parse_ack() {
        let mut record = vec![MSG_TYPE_ACK_CLIPBOARD];
        record.put_u64(77);
        let (msg, consumed) = parse_device_message(&record);
        assert_eq!(consumed, 9);
        assert_eq!(msg, Some(DeviceMessage::AckClipboard { sequence: 77 }));
    }

    #[test]
    fn test_parse_uhid_output() {
        let mut record = vec![MSG_TYPE_UHID_OUTPUT];
        record.put_u16(3);
        record.put_u16(4);
        record.extend_from_slice(&[9, 8, 7, 6]);
        let (msg, consumed) = parse_device_message(&record);
        assert_eq!(consumed, 9);
        assert_eq!(
            msg,
            Some(DeviceMessage::UhidOutput {
                id: 3,
                data: vec![9, 8, 7, 6]
            })
        );
    }

    fn app_list_record(apps: &[(&str, &str, bool)]) -> Vec<u8> {
        let mut buf = vec![MSG_TYPE_APP_LIST];
        buf.put_u16(apps.len() as u16);
        for (name, pkg, system) in apps {
            buf.put_u8(*system as u8);
            buf.put_u16(name.len() as u16);
            buf.extend_from_slice(name.as_bytes());
            buf.put_u16(pkg.len() as u16);
            buf.extend_from_slice(pkg.as_bytes());
        }
        buf
    }

    #[test]
    fn test_parse_app_list() {
        let record = app_list_record(&[
            ("Firefox", "org.mozilla.firefox", false),
            ("Camera", "com.android.camera", true),
        ]);
        let (msg, consumed) = parse_device_message(&record);
        assert_eq!(consumed, record.len());
        assert_eq!(
            msg,
            Some(DeviceMessage::AppList {
                apps: vec![
                    AppInfo {
                        name: "Firefox".to_string(),
                        package: "org.mozilla.firefox".to_string(),
                        system: false,
                    },
                    AppInfo {
                        name: "Camera".to_string(),
                        package: "com.android.camera".to_string(),
                        system: true,
                    },
                ]
            })
        );
    }

    #[test]
    fn test_parse_app_list_incomplete() {
        let record = app_list_record(&[("Firefox", "org.mozilla.firefox", false)]);
        let (msg, consumed) = parse_device_message(&record[..record.len() - 3]);
        assert_eq!(consumed, 0);
        assert_eq!(msg, None);
    }

    #[test]
    fn test_unknown_type_discards_buffer() {
        let record = [0xAB, 1, 2, 3, 4];
        let (msg, consumed) = parse_device_message(&record);
        assert_eq!(consumed, record.len());
        assert_eq!(msg, None);
    }

    #[tokio::test]
    async fn test_receiver_reassembles_fragmented_records() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use tokio::io::AsyncWriteExt;

        let (mut tx, rx) = tokio::io::duplex(8);
        let callbacks = Arc::new(DeviceMessageCallbacks::default());
        let received = Arc::new(Mutex::new(Vec::new()));
        let acks = Arc::new(AtomicUsize::new(0));

        {
            let received = received.clone();
            callbacks.set_on_clipboard(move |(text, _seq)| received.lock().push(text));
        }
        {
            let acks = acks.clone();
            callbacks.set_on_clipboard_ack(move |_seq| {
                acks.fetch_add(1, Ordering::SeqCst);
            });
        }

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let receiver = DeviceMessageReceiver::new(rx, callbacks, shutdown_rx);
        let handle = tokio::spawn(receiver.run());

        // Two records delivered in 2-byte fragments across recv boundaries
        let mut wire = clipboard_record("first");
        wire.push(MSG_TYPE_ACK_CLIPBOARD);
        wire.put_u64(5);
        wire.extend(clipboard_record("second"));

        for chunk in wire.chunks(2) {
            tx.write_all(chunk).await.unwrap();
            tx.flush().await.unwrap();
        }
        drop(tx);
        handle.await.unwrap().unwrap();

        assert_eq!(*received.lock(), vec!["first", "second"]);
        assert_eq!(acks.load(Ordering::SeqCst), 1);
    }
}
