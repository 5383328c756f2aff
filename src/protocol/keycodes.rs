//! Android input constants, from AOSP `android/keycodes.h` and
//! `android/input.h`. Only the subset the client injects is listed.

/// Key event actions (AKEY_EVENT_ACTION_*)
pub const ACTION_DOWN: u8 = 0;
pub const ACTION_UP: u8 = 1;

/// Motion event actions (AMOTION_EVENT_ACTION_*)
pub const MOTION_ACTION_DOWN: u8 = 0;
pub const MOTION_ACTION_UP: u8 = 1;
pub const MOTION_ACTION_MOVE: u8 = 2;

/// Pointer ids understood by the server (int64 on the wire)
pub const POINTER_ID_MOUSE: i64 = -1;
pub const POINTER_ID_GENERIC_FINGER: i64 = -2;

/// Meta key states (AMETA_*)
pub const META_NONE: u32 = 0;
pub const META_CTRL_ON: u32 = 0x1000;

/// Keycodes (AKEYCODE_*)
pub const KEYCODE_HOME: u32 = 3;
pub const KEYCODE_BACK: u32 = 4;
pub const KEYCODE_DPAD_UP: u32 = 19;
pub const KEYCODE_DPAD_DOWN: u32 = 20;
pub const KEYCODE_DPAD_LEFT: u32 = 21;
pub const KEYCODE_DPAD_RIGHT: u32 = 22;
pub const KEYCODE_DPAD_CENTER: u32 = 23;
pub const KEYCODE_VOLUME_UP: u32 = 24;
pub const KEYCODE_VOLUME_DOWN: u32 = 25;
pub const KEYCODE_POWER: u32 = 26;
pub const KEYCODE_V: u32 = 50;
pub const KEYCODE_TAB: u32 = 61;
pub const KEYCODE_ENTER: u32 = 66;
pub const KEYCODE_MENU: u32 = 82;
pub const KEYCODE_ESCAPE: u32 = 111;
pub const KEYCODE_APP_SWITCH: u32 = 187;
