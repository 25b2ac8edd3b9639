use esp_idf_hal::{
    gpio::{AnyIOPin, OutputPin},
    peripheral::Peripheral,
    spi::{config, SpiAnyPins, SpiDeviceDriver, SpiDriver},
    units::FromValueType,
};
use log::{debug, warn};

use alarmclock_common::DisplayDriver;

const REG_DIGIT0: u8 = 0x01;
const REG_DECODE_MODE: u8 = 0x09;
const REG_INTENSITY: u8 = 0x0A;
const REG_SCAN_LIMIT: u8 = 0x0B;
const REG_SHUTDOWN: u8 = 0x0C;
const REG_DISPLAY_TEST: u8 = 0x0F;

const DIGITS: usize = 6;
const DECODE_ALL: u8 = 0xFF;
const INTENSITY: u8 = 0x01;
const SPI_CLOCK_MHZ: u32 = 1;

// Code-B font values.
const CODE_B_DASH: u8 = 0x0A;
const CODE_B_BLANK: u8 = 0x0F;

enum DisplayBackend {
    Spi(SpiDeviceDriver<'static, SpiDriver<'static>>),
    Disabled,
}

/// Six-digit seven-segment display behind a MAX7219 in code-B mode.
///
/// `codes[0]` is the leftmost digit, which the chip calls digit 5.
pub struct Max7219Display {
    backend: DisplayBackend,
    shown: Option<[u8; DIGITS]>,
    failed_writes: u64,
    last_error: Option<String>,
}

impl Max7219Display {
    pub fn new<SPI, SCLK, SDO, CS>(
        spi: impl Peripheral<P = SPI> + 'static,
        sclk: impl Peripheral<P = SCLK> + 'static,
        sdo: impl Peripheral<P = SDO> + 'static,
        cs: impl Peripheral<P = CS> + 'static,
    ) -> anyhow::Result<Self>
    where
        SPI: SpiAnyPins,
        SCLK: OutputPin,
        SDO: OutputPin,
        CS: OutputPin,
    {
        let device_config = config::Config::new().baudrate(SPI_CLOCK_MHZ.MHz().into());
        let device = SpiDeviceDriver::new_single(
            spi,
            sclk,
            sdo,
            Option::<AnyIOPin>::None,
            Some(cs),
            &config::DriverConfig::new(),
            &device_config,
        )?;

        let mut display = Self {
            backend: DisplayBackend::Spi(device),
            shown: None,
            failed_writes: 0,
            last_error: None,
        };
        display.init()?;
        Ok(display)
    }

    pub fn disabled() -> Self {
        Self {
            backend: DisplayBackend::Disabled,
            shown: None,
            failed_writes: 0,
            last_error: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.backend, DisplayBackend::Spi(_))
    }

    pub fn failed_writes(&self) -> u64 {
        self.failed_writes
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn init(&mut self) -> anyhow::Result<()> {
        self.write_register(REG_DISPLAY_TEST, 0x00)?;
        self.write_register(REG_DECODE_MODE, DECODE_ALL)?;
        self.write_register(REG_SCAN_LIMIT, (DIGITS - 1) as u8)?;
        self.write_register(REG_INTENSITY, INTENSITY)?;
        self.write_register(REG_SHUTDOWN, 0x01)?;
        self.write_codes([CODE_B_BLANK; DIGITS]);
        Ok(())
    }

    fn write_register(&mut self, register: u8, value: u8) -> anyhow::Result<()> {
        match &mut self.backend {
            DisplayBackend::Spi(device) => {
                device.write(&[register, value])?;
                Ok(())
            }
            DisplayBackend::Disabled => Ok(()),
        }
    }

    /// Pushes only the digits that differ from what the chip already shows.
    /// A failed write forgets the cached frame so the next call repaints.
    fn write_codes(&mut self, codes: [u8; DIGITS]) {
        if !self.is_enabled() || self.shown == Some(codes) {
            return;
        }

        let previous = self.shown.take();
        for (index, code) in codes.iter().enumerate() {
            if previous.is_some_and(|shown| shown[index] == *code) {
                continue;
            }
            if let Err(err) = self.write_register(digit_register(index), *code) {
                self.failed_writes += 1;
                warn!("display write failed on digit {index}: {err:#}");
                self.last_error = Some(format!("{err:#}"));
                return;
            }
        }
        self.shown = Some(codes);
    }
}

impl DisplayDriver for Max7219Display {
    fn render(&mut self, hour: u8, minute: u8, second: u8) {
        self.write_codes([
            hour / 10,
            hour % 10,
            minute / 10,
            minute % 10,
            second / 10,
            second % 10,
        ]);
    }

    fn render_text(&mut self, text: &str) {
        debug!("display text `{text}`");
        self.write_codes(text_codes(text));
    }

    fn clear(&mut self) {
        self.write_codes([CODE_B_BLANK; DIGITS]);
    }
}

fn digit_register(index: usize) -> u8 {
    REG_DIGIT0 + (DIGITS - 1 - index) as u8
}

fn code_b(c: char) -> u8 {
    match c {
        '0'..='9' => c as u8 - b'0',
        '-' => CODE_B_DASH,
        'E' | 'e' => 0x0B,
        'H' | 'h' => 0x0C,
        'L' | 'l' => 0x0D,
        'P' | 'p' => 0x0E,
        _ => CODE_B_BLANK,
    }
}

/// Right-aligns the last six characters of `text`, padding with blanks.
fn text_codes(text: &str) -> [u8; DIGITS] {
    let mut codes = [CODE_B_BLANK; DIGITS];
    let chars: Vec<char> = text.chars().collect();
    let tail = &chars[chars.len().saturating_sub(DIGITS)..];
    let start = DIGITS - tail.len();
    for (slot, c) in codes[start..].iter_mut().zip(tail) {
        *slot = code_b(*c);
    }
    codes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rightmost_digit_is_register_one() {
        assert_eq!(digit_register(5), REG_DIGIT0);
        assert_eq!(digit_register(0), 0x06);
    }

    #[test]
    fn text_is_right_aligned_in_code_b() {
        assert_eq!(text_codes("------"), [CODE_B_DASH; DIGITS]);
        assert_eq!(text_codes("HELP"), [0x0F, 0x0F, 0x0C, 0x0B, 0x0D, 0x0E]);
        assert_eq!(text_codes("12:34:56"), [0x0F, 3, 4, 0x0F, 5, 6]);
    }

    #[test]
    fn unknown_characters_are_blank() {
        assert_eq!(code_b('?'), CODE_B_BLANK);
        assert_eq!(code_b(' '), CODE_B_BLANK);
    }

    #[test]
    fn disabled_display_ignores_writes() {
        let mut display = Max7219Display::disabled();
        display.render(12, 34, 56);
        display.render_text("------");
        assert!(!display.is_enabled());
        assert_eq!(display.failed_writes(), 0);
        assert_eq!(display.last_error(), None);
    }
}
