//! Driver for the TonTouch TTP229 capacitive touch keypad.
//!
//! The implementation is based on the [Adafruit CircuitPython TTP229
//! library](https://github.com/dcooperdalrymple/CircuitPython_TTP229).
//!
//! The TTP229 exposes up to 16 touch channels over a specialized 2-wire
//! serial interface: one data line and one clock line driven by the host.
//! The chip must be strapped for serial mode (not I2C). Both 8-key and
//! 16-key mode are supported, with either clock polarity, selected at
//! construction.
//!
//! Samples are obtained either by bit-banging the clock line in software
//! ([`BitBang`]) or by draining an autonomous hardware sampling engine
//! ([`Assisted`] over [`SampleEngine`]). The backend is fixed when the
//! driver is built. On a Raspberry Pi, [`Ttp229::init`] claims the two GPIO
//! lines and sets up the software-clocked backend in one call.
//!
//! ## Example
//!
//! ```rust, ignore
//! pub fn main() {
//!     use std::thread;
//!     use std::time::Duration;
//!     use ttp229::{Mode, Polarity, Ttp229};
//!
//!     let mut keypad = Ttp229::init(0, 1, Mode::Key16, Polarity::ActiveHigh).unwrap();
//!     keypad.set_on_press(|key| println!("key {} pressed", key));
//!     keypad.set_on_release(|key| println!("key {} released", key));
//!
//!     loop {
//!         keypad.poll().unwrap();
//!         thread::sleep(Duration::from_millis(10));
//!     }
//! }
//! ```
//!
//! ## Debugging
//!
//! The driver logs through the `log` facade. Attaching a logger and setting
//! `RUST_LOG=debug` will show resource acquisition and every key transition.

use std::convert::Infallible;
use std::fmt::Debug;

use log::debug;
use rppal::gpio::{self, Gpio};
use rppal::hal::Delay;
use thiserror::Error;

mod acquire;

pub use acquire::{Acquire, Assisted, BitBang, Polarity, SampleEngine, CLOCK_HALF_PERIOD_US};

/// Key mode of the TTP229, strapped on the chip's option pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// 8-key mode.
    Key8,
    /// 16-key mode (the chip's default).
    #[default]
    Key16,
}

impl Mode {
    /// Number of touch channels clocked out per word.
    pub fn channels(self) -> usize {
        match self {
            Mode::Key8 => 8,
            Mode::Key16 => 16,
        }
    }

    fn mask(self) -> u16 {
        match self {
            Mode::Key8 => 0x00ff,
            Mode::Key16 => 0xffff,
        }
    }
}

/// The TTP229 driver on Raspberry Pi GPIO, clocked in software.
pub type RpiTtp229 = Ttp229<BitBang<gpio::InputPin, gpio::OutputPin, Delay>>;

/// Driver for the TTP229 serial interface capacitive touch sensor.
///
/// The state of each touch channel can be read after calling
/// [`Ttp229::poll`] through [`Ttp229::sample`] or [`Ttp229::channel`], or
/// observed as events through the `on_press`/`on_release` handler slots.
///
/// The driver is single-threaded by design: call `poll` from one loop and,
/// if multiple threads need access, serialize the calls externally.
pub struct Ttp229<B> {
    backend: B,
    mode: Mode,
    current: u16,
    previous: u16,
    on_press: Option<Box<dyn FnMut(usize)>>,
    on_release: Option<Box<dyn FnMut(usize)>>,
}

impl RpiTtp229 {
    /// Claims the two GPIO lines and initializes the driver with the
    /// software-clocked backend.
    ///
    /// `sdo` and `scl` are BCM pin numbers. The data line is configured as
    /// an input with the internal pull-up enabled and the clock line as an
    /// output. A failure to claim either line is propagated unchanged.
    pub fn init(
        sdo: u8,
        scl: u8,
        mode: Mode,
        polarity: Polarity,
    ) -> Result<Self, Ttp229Err<Infallible>> {
        let lines = Gpio::new()?;
        let sdo = lines.get(sdo)?.into_input_pullup();
        let scl = lines.get(scl)?.into_output();
        debug!(
            "claimed GPIO lines, {} channels, {:?} clock",
            mode.channels(),
            polarity
        );
        Ok(Ttp229::new(
            BitBang::new(sdo, scl, Delay::new(), polarity),
            mode,
        ))
    }
}

impl<B> Ttp229<B> {
    /// Creates a driver around an already-configured acquisition backend.
    pub fn new(backend: B, mode: Mode) -> Self {
        Ttp229 {
            backend,
            mode,
            current: 0,
            previous: 0,
            on_press: None,
            on_release: None,
        }
    }

    /// The state of every key as a binary-indexed bit-field, as of the last
    /// successful poll. Bit `i` set means channel `i` is touched.
    pub fn sample(&self) -> u16 {
        self.current
    }

    /// Whether the given key is currently touched.
    ///
    /// The index is taken modulo [`Ttp229::channel_count`]; out-of-range
    /// indices wrap around rather than fail, so callers must not rely on
    /// this as a validity check.
    pub fn channel(&self, index: usize) -> bool {
        self.current & (1 << (index % self.mode.channels())) != 0
    }

    /// Number of touch channels in the configured key mode.
    pub fn channel_count(&self) -> usize {
        self.mode.channels()
    }

    /// Registers a handler called with the key index for every new press
    /// detected by [`Ttp229::poll`].
    pub fn set_on_press(&mut self, handler: impl FnMut(usize) + 'static) {
        self.on_press = Some(Box::new(handler));
    }

    /// Removes the press handler. Presses are then detected but not
    /// reported, which is not an error.
    pub fn clear_on_press(&mut self) {
        self.on_press = None;
    }

    /// Registers a handler called with the key index for every release
    /// detected by [`Ttp229::poll`].
    pub fn set_on_release(&mut self, handler: impl FnMut(usize) + 'static) {
        self.on_release = Some(Box::new(handler));
    }

    /// Removes the release handler.
    pub fn clear_on_release(&mut self) {
        self.on_release = None;
    }

    /// Tears the driver down and hands back the acquisition backend, whose
    /// own `release` returns the underlying lines or sampling engine for
    /// reuse elsewhere.
    pub fn release(self) -> B {
        self.backend
    }
}

impl<B: Acquire> Ttp229<B>
where
    B::Error: Debug,
{
    /// Obtains a fresh sample if one is available and dispatches press and
    /// release events for every channel that changed since the last sample,
    /// in increasing channel order.
    ///
    /// Returns `Ok(true)` when a new sample was processed. `Ok(false)` means
    /// no word was ready, which only happens with the hardware-assisted
    /// backend and leaves the key state untouched.
    pub fn poll(&mut self) -> Result<bool, Ttp229Err<B::Error>> {
        let bits = self.mode.channels() as u8;
        let word = match self.backend.acquire(bits).map_err(Ttp229Err::Acquire)? {
            Some(word) => word,
            None => return Ok(false),
        };

        self.current = word & self.mode.mask();
        self.dispatch();
        self.previous = self.current;

        Ok(true)
    }

    fn dispatch(&mut self) {
        for i in 0..self.mode.channels() {
            let bit = 1 << i;
            if self.current & bit == self.previous & bit {
                continue;
            }
            if self.current & bit != 0 {
                debug!("key {} pressed", i);
                if let Some(handler) = self.on_press.as_mut() {
                    handler(i);
                }
            } else {
                debug!("key {} released", i);
                if let Some(handler) = self.on_release.as_mut() {
                    handler(i);
                }
            }
        }
    }
}

/// Errors reported by the TTP229 driver.
#[derive(Debug, Error)]
pub enum Ttp229Err<E: Debug> {
    /// Failed to claim a GPIO resource.
    #[error("GPIO resource error. {source}")]
    Gpio {
        #[from]
        source: gpio::Error,
    },
    /// The acquisition backend reported a fault on the serial lines.
    #[error("sample acquisition failed: {0:?}")]
    Acquire(E),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    struct FakeEngine {
        words: VecDeque<u16>,
    }

    impl FakeEngine {
        fn new(words: &[u16]) -> Self {
            FakeEngine {
                words: words.iter().copied().collect(),
            }
        }
    }

    impl SampleEngine for FakeEngine {
        type Error = Infallible;

        fn pending_words(&self) -> usize {
            self.words.len()
        }

        fn dequeue_word(&mut self) -> Result<u16, Infallible> {
            Ok(self.words.pop_front().unwrap())
        }
    }

    type Events = Rc<RefCell<Vec<(&'static str, usize)>>>;

    /// Driver fed from a queue of canned words, recording every dispatched
    /// event as ("press"/"release", key index).
    fn driver_with_words(mode: Mode, words: &[u16]) -> (Ttp229<Assisted<FakeEngine>>, Events) {
        let mut keypad = Ttp229::new(Assisted::new(FakeEngine::new(words)), mode);
        let events: Events = Rc::new(RefCell::new(Vec::new()));

        let press = Rc::clone(&events);
        keypad.set_on_press(move |i| press.borrow_mut().push(("press", i)));
        let release = Rc::clone(&events);
        keypad.set_on_release(move |i| release.borrow_mut().push(("release", i)));

        (keypad, events)
    }

    #[test]
    fn mode_selects_channel_count() {
        let (eight, _) = driver_with_words(Mode::Key8, &[]);
        let (sixteen, _) = driver_with_words(Mode::Key16, &[]);
        assert_eq!(eight.channel_count(), 8);
        assert_eq!(sixteen.channel_count(), 16);
    }

    #[test]
    fn first_key_press_dispatches_index_zero() {
        let (mut keypad, events) = driver_with_words(Mode::Key16, &[0b0000_0000_0000_0001]);

        assert!(keypad.poll().unwrap());
        assert_eq!(keypad.sample(), 0b0000_0000_0000_0001);
        assert_eq!(*events.borrow(), vec![("press", 0)]);
    }

    #[test]
    fn release_leaves_unchanged_keys_alone() {
        let (mut keypad, events) =
            driver_with_words(Mode::Key16, &[0b0000_0000_0000_0101, 0b0000_0000_0000_0100]);

        assert!(keypad.poll().unwrap());
        events.borrow_mut().clear();

        assert!(keypad.poll().unwrap());
        assert_eq!(*events.borrow(), vec![("release", 0)]);
    }

    #[test]
    fn events_dispatch_in_increasing_key_order() {
        // 0b0110 -> 0b1001: every low key changes, mixed presses and
        // releases.
        let (mut keypad, events) = driver_with_words(Mode::Key16, &[0b0110, 0b1001]);

        assert!(keypad.poll().unwrap());
        events.borrow_mut().clear();

        assert!(keypad.poll().unwrap());
        assert_eq!(
            *events.borrow(),
            vec![("press", 0), ("release", 1), ("release", 2), ("press", 3)]
        );
    }

    #[test]
    fn dispatch_matches_bit_diff_for_all_byte_pairs() {
        for previous in 0u16..256 {
            for current in 0u16..256 {
                let (mut keypad, events) = driver_with_words(Mode::Key8, &[previous, current]);
                keypad.poll().unwrap();
                events.borrow_mut().clear();
                keypad.poll().unwrap();

                let mut expected = Vec::new();
                for i in 0..8usize {
                    let bit = 1u16 << i;
                    if previous & bit != current & bit {
                        let kind = if current & bit != 0 { "press" } else { "release" };
                        expected.push((kind, i));
                    }
                }
                assert_eq!(
                    *events.borrow(),
                    expected,
                    "previous={previous:#04x} current={current:#04x}"
                );
            }
        }
    }

    #[test]
    fn missing_handler_skips_dispatch_for_that_kind_only() {
        let mut keypad = Ttp229::new(Assisted::new(FakeEngine::new(&[0b01, 0b10])), Mode::Key16);

        // No handlers registered at all: polling still succeeds.
        assert!(keypad.poll().unwrap());

        let presses: Events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&presses);
        keypad.set_on_press(move |i| sink.borrow_mut().push(("press", i)));

        // Key 0 releases (unreported) and key 1 presses in the same word.
        assert!(keypad.poll().unwrap());
        assert_eq!(*presses.borrow(), vec![("press", 1)]);
    }

    #[test]
    fn empty_queue_returns_false_without_side_effects() {
        let (mut keypad, events) = driver_with_words(Mode::Key16, &[]);

        assert!(!keypad.poll().unwrap());
        assert_eq!(keypad.sample(), 0);
        assert!(events.borrow().is_empty());
    }

    #[test]
    fn repeated_poll_without_new_data_fires_nothing() {
        let (mut keypad, events) = driver_with_words(Mode::Key16, &[0b1000]);

        assert!(keypad.poll().unwrap());
        assert_eq!(*events.borrow(), vec![("press", 3)]);

        assert!(!keypad.poll().unwrap());
        assert_eq!(keypad.sample(), 0b1000);
        assert_eq!(*events.borrow(), vec![("press", 3)]);
    }

    #[test]
    fn channel_agrees_with_sample_bits_and_wraps() {
        let (mut keypad, _) = driver_with_words(Mode::Key16, &[0xa5a5]);
        assert!(keypad.poll().unwrap());

        for i in 0..keypad.channel_count() {
            assert_eq!(keypad.channel(i), keypad.sample() & (1 << i) != 0);
            assert_eq!(
                keypad.channel(keypad.channel_count() + i),
                keypad.channel(i)
            );
        }
        assert_eq!(keypad.channel(35), keypad.channel(3));
    }

    #[test]
    fn eight_key_mode_masks_the_high_byte() {
        let (mut keypad, events) = driver_with_words(Mode::Key8, &[0x0101]);

        assert!(keypad.poll().unwrap());
        assert_eq!(keypad.sample(), 0x0001);
        assert_eq!(*events.borrow(), vec![("press", 0)]);
    }

    #[test]
    fn release_hands_the_engine_back() {
        let (keypad, _) = driver_with_words(Mode::Key16, &[0xffff]);

        let engine = keypad.release().release();
        assert_eq!(engine.pending_words(), 1);
    }
}
