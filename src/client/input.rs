use super::{ClientError, Result, ScrcpyClient};
use crate::control::ControlMessage;
use crate::protocol::keycodes;
use std::time::Duration;
use tracing::debug;

/// Minimum number of interpolated MOVE events in a swipe
const SWIPE_MIN_STEPS: u32 = 5;

/// Target spacing between swipe MOVE events (~15 events per second)
const SWIPE_STEP_MS: u64 = 60;

/// At least five MOVEs, more for long gestures so spacing stays ~60 ms
fn swipe_step_count(duration: Duration) -> u32 {
    SWIPE_MIN_STEPS.max((duration.as_millis() as u64 / SWIPE_STEP_MS) as u32)
}

impl ScrcpyClient {
    fn touch(&self, action: u8, x: i32, y: i32, pressure: f32) -> Result<()> {
        let (width, height) = self.device_size();
        if width == 0 || height == 0 {
            return Err(ClientError::BadArgument(
                "device size unknown".to_string(),
            ));
        }
        self.queue_message(ControlMessage::InjectTouch {
            action,
            pointer_id: keycodes::POINTER_ID_GENERIC_FINGER,
            x,
            y,
            width: width as u16,
            height: height as u16,
            pressure,
            action_button: 0,
            buttons: 0,
        })
    }

    /// Tap at screen coordinates: DOWN then UP
    pub fn tap(&self, x: i32, y: i32) -> Result<()> {
        debug!("tap({}, {})", x, y);
        self.touch(keycodes::MOTION_ACTION_DOWN, x, y, 1.0)?;
        self.touch(keycodes::MOTION_ACTION_UP, x, y, 0.0)
    }

    /// Swipe from (x1,y1) to (x2,y2): DOWN, evenly spaced MOVEs, UP
    pub async fn swipe(&self, x1: i32, y1: i32, x2: i32, y2: i32, duration: Duration) -> Result<()> {
        debug!("swipe({}, {}) -> ({}, {})", x1, y1, x2, y2);
        self.touch(keycodes::MOTION_ACTION_DOWN, x1, y1, 1.0)?;

        let steps = swipe_step_count(duration);
        let step_delay = duration / steps;
        for i in 1..=steps {
            let progress = i as f64 / steps as f64;
            let x = x1 + ((x2 - x1) as f64 * progress).round() as i32;
            let y = y1 + ((y2 - y1) as f64 * progress).round() as i32;
            self.touch(keycodes::MOTION_ACTION_MOVE, x, y, 1.0)?;
            tokio::time::sleep(step_delay).await;
        }

        self.touch(keycodes::MOTION_ACTION_UP, x2, y2, 0.0)
    }

    /// Press and hold at (x,y) for the given duration
    pub async fn long_press(&self, x: i32, y: i32, duration: Duration) -> Result<()> {
        self.touch(keycodes::MOTION_ACTION_DOWN, x, y, 1.0)?;
        tokio::time::sleep(duration).await;
        self.touch(keycodes::MOTION_ACTION_UP, x, y, 0.0)
    }

    /// Scroll at (x,y); h/v in [-1, 1]
    pub fn scroll(&self, x: i32, y: i32, hscroll: f32, vscroll: f32) -> Result<()> {
        let (width, height) = self.device_size();
        self.queue_message(ControlMessage::InjectScroll {
            x,
            y,
            width: width as u16,
            height: height as u16,
            hscroll,
            vscroll,
            buttons: 0,
        })
    }

    /// Type text into the focused field
    pub fn inject_text(&self, text: impl Into<String>) -> Result<()> {
        self.queue_message(ControlMessage::InjectText { text: text.into() })
    }

    /// Press and release a hardware key
    pub fn press_key(&self, keycode: u32) -> Result<()> {
        self.press_key_with_meta(keycode, keycodes::META_NONE)
    }

    pub fn press_key_with_meta(&self, keycode: u32, metastate: u32) -> Result<()> {
        self.queue_message(ControlMessage::InjectKeycode {
            action: keycodes::ACTION_DOWN,
            keycode,
            repeat: 0,
            metastate,
        })?;
        self.queue_message(ControlMessage::InjectKeycode {
            action: keycodes::ACTION_UP,
            keycode,
            repeat: 0,
            metastate,
        })
    }

    pub fn home(&self) -> Result<()> {
        self.press_key(keycodes::KEYCODE_HOME)
    }

    pub fn back(&self) -> Result<()> {
        self.press_key(keycodes::KEYCODE_BACK)
    }

    pub fn menu(&self) -> Result<()> {
        self.press_key(keycodes::KEYCODE_MENU)
    }

    pub fn enter(&self) -> Result<()> {
        self.press_key(keycodes::KEYCODE_ENTER)
    }

    pub fn tab(&self) -> Result<()> {
        self.press_key(keycodes::KEYCODE_TAB)
    }

    pub fn escape(&self) -> Result<()> {
        self.press_key(keycodes::KEYCODE_ESCAPE)
    }

    pub fn volume_up(&self) -> Result<()> {
        self.press_key(keycodes::KEYCODE_VOLUME_UP)
    }

    pub fn volume_down(&self) -> Result<()> {
        self.press_key(keycodes::KEYCODE_VOLUME_DOWN)
    }

    pub fn app_switch(&self) -> Result<()> {
        self.press_key(keycodes::KEYCODE_APP_SWITCH)
    }

    pub fn dpad_up(&self) -> Result<()> {
        self.press_key(keycodes::KEYCODE_DPAD_UP)
    }

    pub fn dpad_down(&self) -> Result<()> {
        self.press_key(keycodes::KEYCODE_DPAD_DOWN)
    }

    pub fn dpad_left(&self) -> Result<()> {
        self.press_key(keycodes::KEYCODE_DPAD_LEFT)
    }

    pub fn dpad_right(&self) -> Result<()> {
        self.press_key(keycodes::KEYCODE_DPAD_RIGHT)
    }

    pub fn dpad_center(&self) -> Result<()> {
        self.press_key(keycodes::KEYCODE_DPAD_CENTER)
    }

    /// BACK, or wake the screen when it is off
    pub fn back_or_screen_on(&self) -> Result<()> {
        self.queue_message(ControlMessage::BackOrScreenOn {
            action: keycodes::ACTION_DOWN,
        })?;
        self.queue_message(ControlMessage::BackOrScreenOn {
            action: keycodes::ACTION_UP,
        })
    }

    pub fn set_display_power(&self, on: bool) -> Result<()> {
        self.queue_message(ControlMessage::SetDisplayPower { on })
    }

    pub fn rotate_device(&self) -> Result<()> {
        self.queue_message(ControlMessage::RotateDevice)
    }

    /// Force the server to restart its video stream (new config + key
    /// frame); useful when the picture freezes
    pub fn reset_video(&self) -> Result<()> {
        self.queue_message(ControlMessage::ResetVideo)
    }

    pub fn expand_notification_panel(&self) -> Result<()> {
        self.queue_message(ControlMessage::ExpandNotificationPanel)
    }

    pub fn expand_settings_panel(&self) -> Result<()> {
        self.queue_message(ControlMessage::ExpandSettingsPanel)
    }

    pub fn collapse_panels(&self) -> Result<()> {
        self.queue_message(ControlMessage::CollapsePanels)
    }

    pub fn open_hard_keyboard_settings(&self) -> Result<()> {
        self.queue_message(ControlMessage::OpenHardKeyboardSettings)
    }

    /// Launch an app by package name, or `?name` to search by label
    pub fn start_app(&self, name: impl Into<String>) -> Result<()> {
        self.queue_message(ControlMessage::StartApp { name: name.into() })
    }

    // ===== UHID (virtual HID devices) =====

    pub fn uhid_create(
        &self,
        id: u16,
        vendor_id: u16,
        product_id: u16,
        name: impl Into<String>,
        report_desc: Vec<u8>,
    ) -> Result<()> {
        self.queue_message(ControlMessage::UhidCreate {
            id,
            vendor_id,
            product_id,
            name: name.into(),
            report_desc,
        })
    }

    pub fn uhid_input(&self, id: u16, data: Vec<u8>) -> Result<()> {
        self.queue_message(ControlMessage::UhidInput { id, data })
    }

    pub fn uhid_destroy(&self, id: u16) -> Result<()> {
        self.queue_message(ControlMessage::UhidDestroy { id })
    }

    /// Receive UHID output reports (e.g. keyboard LED state)
    pub fn set_uhid_output_callback(
        &self,
        callback: impl Fn(u16, Vec<u8>) + Send + 'static,
    ) -> Result<()> {
        let runtime = self.runtime.as_ref().ok_or(ClientError::NotConnected)?;
        runtime
            .callbacks
            .set_on_uhid_output(move |(id, data)| callback(id, data));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swipe_step_count() {
        // 300 ms swipe: the 5-step floor, MOVEs spaced ~60 ms
        assert_eq!(swipe_step_count(Duration::from_millis(300)), 5);
        assert_eq!(swipe_step_count(Duration::from_millis(100)), 5);
        // Longer gestures scale with the ~60 ms spacing
        assert_eq!(swipe_step_count(Duration::from_millis(1200)), 20);
    }
}
