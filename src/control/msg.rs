use bytes::{BufMut, BytesMut};

/// Control message type bytes (client to server)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessageType {
    InjectKeycode = 0,
    InjectText = 1,
    InjectTouch = 2,
    InjectScroll = 3,
    BackOrScreenOn = 4,
    ExpandNotificationPanel = 5,
    ExpandSettingsPanel = 6,
    CollapsePanels = 7,
    GetClipboard = 8,
    SetClipboard = 9,
    SetDisplayPower = 10,
    RotateDevice = 11,
    UhidCreate = 12,
    UhidInput = 13,
    UhidDestroy = 14,
    OpenHardKeyboardSettings = 15,
    StartApp = 16,
    ResetVideo = 17,
    Screenshot = 18,
    GetAppList = 19,
}

/// Key used by GET_CLIPBOARD to optionally simulate copy/cut first
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyKey {
    #[default]
    None = 0,
    Copy = 1,
    Cut = 2,
}

/// Payload byte caps, from the server's message parser
pub const INJECT_TEXT_MAX_LENGTH: usize = 300;
pub const CLIPBOARD_TEXT_MAX_LENGTH: usize = 262_144;
pub const UHID_NAME_MAX_LENGTH: usize = 127;
pub const START_APP_NAME_MAX_LENGTH: usize = 255;

/// A control message bound for the device
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    InjectKeycode {
        action: u8,
        keycode: u32,
        repeat: u32,
        metastate: u32,
    },
    InjectText {
        text: String,
    },
    InjectTouch {
        action: u8,
        pointer_id: i64,
        x: i32,
        y: i32,
        width: u16,
        height: u16,
        pressure: f32,
        action_button: u32,
        buttons: u32,
    },
    InjectScroll {
        x: i32,
        y: i32,
        width: u16,
        height: u16,
        hscroll: f32,
        vscroll: f32,
        buttons: u32,
    },
    BackOrScreenOn {
        action: u8,
    },
    ExpandNotificationPanel,
    ExpandSettingsPanel,
    CollapsePanels,
    GetClipboard {
        copy_key: CopyKey,
    },
    SetClipboard {
        sequence: u64,
        paste: bool,
        text: String,
    },
    SetDisplayPower {
        on: bool,
    },
    RotateDevice,
    UhidCreate {
        id: u16,
        vendor_id: u16,
        product_id: u16,
        name: String,
        report_desc: Vec<u8>,
    },
    UhidInput {
        id: u16,
        data: Vec<u8>,
    },
    UhidDestroy {
        id: u16,
    },
    OpenHardKeyboardSettings,
    StartApp {
        name: String,
    },
    ResetVideo,
    Screenshot,
    GetAppList,
}

/// Pressure as a u16 fixed-point value. 1.0 maps to 0xFFFE, not 0x10000.
pub fn pressure_to_u16(pressure: f32) -> u16 {
    let scaled = (pressure.clamp(0.0, 1.0) * 0xFFFF as f32) as i64;
    scaled.clamp(0, 0xFFFE) as u16
}

/// Scroll value in [-1, 1] as an i16 fixed-point value with 0x8000 scale
pub fn scroll_to_i16(value: f32) -> i16 {
    let scaled = (value.clamp(-1.0, 1.0) * 0x8000 as f32).round() as i32;
    scaled.clamp(-0x8000, 0x7FFF) as i16
}

/// Truncate to at most `max_bytes` of UTF-8 without splitting a character
fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

impl ControlMessage {
    pub fn message_type(&self) -> ControlMessageType {
        match self {
            ControlMessage::InjectKeycode { .. } => ControlMessageType::InjectKeycode,
            ControlMessage::InjectText { .. } => ControlMessageType::InjectText,
            ControlMessage::InjectTouch { .. } => ControlMessageType::InjectTouch,
            ControlMessage::InjectScroll { .. } => ControlMessageType::InjectScroll,
            ControlMessage::BackOrScreenOn { .. } => ControlMessageType::BackOrScreenOn,
            ControlMessage::ExpandNotificationPanel => ControlMessageType::ExpandNotificationPanel,
            ControlMessage::ExpandSettingsPanel => ControlMessageType::ExpandSettingsPanel,
            ControlMessage::CollapsePanels => ControlMessageType::CollapsePanels,
            ControlMessage::GetClipboard { .. } => ControlMessageType::GetClipboard,
            ControlMessage::SetClipboard { .. } => ControlMessageType::SetClipboard,
            ControlMessage::SetDisplayPower { .. } => ControlMessageType::SetDisplayPower,
            ControlMessage::RotateDevice => ControlMessageType::RotateDevice,
            ControlMessage::UhidCreate { .. } => ControlMessageType::UhidCreate,
            ControlMessage::UhidInput { .. } => ControlMessageType::UhidInput,
            ControlMessage::UhidDestroy { .. } => ControlMessageType::UhidDestroy,
            ControlMessage::OpenHardKeyboardSettings => {
                ControlMessageType::OpenHardKeyboardSettings
            }
            ControlMessage::StartApp { .. } => ControlMessageType::StartApp,
            ControlMessage::ResetVideo => ControlMessageType::ResetVideo,
            ControlMessage::Screenshot => ControlMessageType::Screenshot,
            ControlMessage::GetAppList => ControlMessageType::GetAppList,
        }
    }

    /// Messages that may be dropped under queue back-pressure. UHID
    /// create/destroy must never be dropped or the kernel-side device
    /// state desynchronizes.
    pub fn is_droppable(&self) -> bool {
        !matches!(
            self,
            ControlMessage::UhidCreate { .. } | ControlMessage::UhidDestroy { .. }
        )
    }

    /// Serialize to the wire layout (big-endian, type byte first)
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.message_type() as u8);

        match self {
            ControlMessage::InjectKeycode {
                action,
                keycode,
                repeat,
                metastate,
            } => {
                buf.put_u8(*action);
                buf.put_u32(*keycode);
                buf.put_u32(*repeat);
                buf.put_u32(*metastate);
            }
            ControlMessage::InjectText { text } => {
                let text = truncate_utf8(text, INJECT_TEXT_MAX_LENGTH);
                buf.put_u32(text.len() as u32);
                buf.put_slice(text.as_bytes());
            }
            ControlMessage::InjectTouch {
                action,
                pointer_id,
                x,
                y,
                width,
                height,
                pressure,
                action_button,
                buttons,
            } => {
                buf.put_u8(*action);
                buf.put_i64(*pointer_id);
                buf.put_i32(*x);
                buf.put_i32(*y);
                buf.put_u16(*width);
                buf.put_u16(*height);
                buf.put_u16(pressure_to_u16(*pressure));
                buf.put_u32(*action_button);
                buf.put_u32(*buttons);
            }
            ControlMessage::InjectScroll {
                x,
                y,
                width,
                height,
                hscroll,
                vscroll,
                buttons,
            } => {
                buf.put_i32(*x);
                buf.put_i32(*y);
                buf.put_u16(*width);
                buf.put_u16(*height);
                buf.put_i16(scroll_to_i16(*hscroll));
                buf.put_i16(scroll_to_i16(*vscroll));
                buf.put_u32(*buttons);
            }
            ControlMessage::BackOrScreenOn { action } => {
                buf.put_u8(*action);
            }
            ControlMessage::GetClipboard { copy_key } => {
                buf.put_u8(*copy_key as u8);
            }
            ControlMessage::SetClipboard {
                sequence,
                paste,
                text,
            } => {
                let text = truncate_utf8(text, CLIPBOARD_TEXT_MAX_LENGTH);
                buf.put_u64(*sequence);
                buf.put_u8(*paste as u8);
                buf.put_u32(text.len() as u32);
                buf.put_slice(text.as_bytes());
            }
            ControlMessage::SetDisplayPower { on } => {
                buf.put_u8(*on as u8);
            }
            ControlMessage::UhidCreate {
                id,
                vendor_id,
                product_id,
                name,
                report_desc,
            } => {
                let name = truncate_utf8(name, UHID_NAME_MAX_LENGTH);
                buf.put_u16(*id);
                buf.put_u16(*vendor_id);
                buf.put_u16(*product_id);
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
                buf.put_u16(report_desc.len() as u16);
                buf.put_slice(report_desc);
            }
            ControlMessage::UhidInput { id, data } => {
                buf.put_u16(*id);
                buf.put_u16(data.len() as u16);
                buf.put_slice(data);
            }
            ControlMessage::UhidDestroy { id } => {
                buf.put_u16(*id);
            }
            ControlMessage::StartApp { name } => {
                let name = truncate_utf8(name, START_APP_NAME_MAX_LENGTH);
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
            }
            // Empty-body kinds: just the type byte
            ControlMessage::ExpandNotificationPanel
            | ControlMessage::ExpandSettingsPanel
            | ControlMessage::CollapsePanels
            | ControlMessage::RotateDevice
            | ControlMessage::OpenHardKeyboardSettings
            | ControlMessage::ResetVideo
            | ControlMessage::Screenshot
            | ControlMessage::GetAppList => {}
        }

        buf.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::keycodes;

    #[test]
    fn test_scroll_fixed_point() {
        assert_eq!(scroll_to_i16(-1.0), i16::MIN);
        assert_eq!(scroll_to_i16(0.0), 0);
        assert_eq!(scroll_to_i16(1.0), 0x7FFF);
        assert_eq!(scroll_to_i16(0.5), 0x4000);
        assert_eq!(scroll_to_i16(-0.5), -0x4000);
        // Out-of-range input clamps before scaling
        assert_eq!(scroll_to_i16(3.0), 0x7FFF);
    }

    #[test]
    fn test_pressure_fixed_point() {
        assert_eq!(pressure_to_u16(0.0), 0);
        assert_eq!(pressure_to_u16(1.0), 0xFFFE);
        assert_eq!(pressure_to_u16(0.5), 0x7FFF);
    }

    #[test]
    fn test_keycode_layout() {
        let msg = ControlMessage::InjectKeycode {
            action: keycodes::ACTION_DOWN,
            keycode: keycodes::KEYCODE_HOME,
            repeat: 0,
            metastate: 0,
        };
        let data = msg.serialize();
        assert_eq!(data.len(), 14);
        assert_eq!(data[0], 0); // type
        assert_eq!(data[1], 0); // action
        assert_eq!(&data[2..6], &3u32.to_be_bytes()); // KEYCODE_HOME
    }

    #[test]
    fn test_touch_layout() {
        let msg = ControlMessage::InjectTouch {
            action: keycodes::MOTION_ACTION_DOWN,
            pointer_id: keycodes::POINTER_ID_GENERIC_FINGER,
            x: 540,
            y: 1200,
            width: 1080,
            height: 2400,
            pressure: 1.0,
            action_button: 0,
            buttons: 0,
        };
        let data = msg.serialize();
        assert_eq!(data.len(), 32);
        assert_eq!(data[0], 2); // type
        assert_eq!(data[1], 0); // ACTION_DOWN
        assert_eq!(&data[2..10], &(-2i64).to_be_bytes());
        assert_eq!(&data[10..14], &540i32.to_be_bytes());
        assert_eq!(&data[14..18], &1200i32.to_be_bytes());
        assert_eq!(&data[18..20], &1080u16.to_be_bytes());
        assert_eq!(&data[20..22], &2400u16.to_be_bytes());
        assert_eq!(&data[22..24], &0xFFFEu16.to_be_bytes());
    }

    #[test]
    fn test_scroll_layout() {
        let msg = ControlMessage::InjectScroll {
            x: 100,
            y: 200,
            width: 1080,
            height: 2400,
            hscroll: 0.0,
            vscroll: -1.0,
            buttons: 0,
        };
        let data = msg.serialize();
        assert_eq!(data.len(), 21);
        assert_eq!(&data[13..15], &0i16.to_be_bytes());
        assert_eq!(&data[15..17], &(-0x8000i32 as i16).to_be_bytes());
    }

    #[test]
    fn test_set_clipboard_layout() {
        let msg = ControlMessage::SetClipboard {
            sequence: 7,
            paste: true,
            text: "hello".to_string(),
        };
        let data = msg.serialize();
        assert_eq!(data[0], 9); // type
        assert_eq!(&data[1..9], &7u64.to_be_bytes());
        assert_eq!(data[9], 1); // paste
        assert_eq!(&data[10..14], &5u32.to_be_bytes());
        assert_eq!(&data[14..], b"hello");
    }

    #[test]
    fn test_inject_text_is_capped_at_char_boundary() {
        // 'é' is two bytes; 200 of them exceed the 300-byte cap
        let text = "é".repeat(200);
        let msg = ControlMessage::InjectText { text };
        let data = msg.serialize();
        let len = u32::from_be_bytes(data[1..5].try_into().unwrap()) as usize;
        assert_eq!(len, 300);
        assert!(std::str::from_utf8(&data[5..5 + len]).is_ok());
    }

    #[test]
    fn test_empty_body_kinds() {
        for (msg, expected_type) in [
            (ControlMessage::ExpandNotificationPanel, 5u8),
            (ControlMessage::ExpandSettingsPanel, 6),
            (ControlMessage::CollapsePanels, 7),
            (ControlMessage::RotateDevice, 11),
            (ControlMessage::OpenHardKeyboardSettings, 15),
            (ControlMessage::ResetVideo, 17),
            (ControlMessage::Screenshot, 18),
            (ControlMessage::GetAppList, 19),
        ] {
            assert_eq!(msg.serialize(), vec![expected_type]);
        }
    }

    #[test]
    fn test_uhid_droppability() {
        let create = ControlMessage::UhidCreate {
            id: 1,
            vendor_id: 0,
            product_id: 0,
            name: "kbd".to_string(),
            report_desc: vec![0x05, 0x01],
        };
        let destroy = ControlMessage::UhidDestroy { id: 1 };
        let input = ControlMessage::UhidInput {
            id: 1,
            data: vec![0],
        };
        assert!(!create.is_droppable());
        assert!(!destroy.is_droppable());
        assert!(input.is_droppable());
        assert!(ControlMessage::RotateDevice.is_droppable());
    }

    #[test]
    fn test_uhid_create_layout() {
        let msg = ControlMessage::UhidCreate {
            id: 2,
            vendor_id: 0x1234,
            product_id: 0x5678,
            name: "mouse".to_string(),
            report_desc: vec![1, 2, 3],
        };
        let data = msg.serialize();
        assert_eq!(data[0], 12);
        assert_eq!(&data[1..3], &2u16.to_be_bytes());
        assert_eq!(&data[3..5], &0x1234u16.to_be_bytes());
        assert_eq!(&data[5..7], &0x5678u16.to_be_bytes());
        assert_eq!(data[7], 5); // name length
        assert_eq!(&data[8..13], b"mouse");
        assert_eq!(&data[13..15], &3u16.to_be_bytes());
        assert_eq!(&data[15..], &[1, 2, 3]);
    }
}
