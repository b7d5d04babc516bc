//! Acquisition backends for the TTP229's 2-wire serial interface.
//!
//! Two interchangeable strategies produce the raw key bit-field. [`BitBang`]
//! clocks the word out in software on the calling thread, [`Assisted`] drains
//! words from an autonomous hardware sampling engine (a PIO-style state
//! machine) reached through the [`SampleEngine`] trait. Both produce
//! bit-compatible words: bit 0 holds the first key clocked out.

use embedded_hal::{
    delay::DelayNs,
    digital::{InputPin, OutputPin},
};

/// Half of one serial clock period in microseconds.
///
/// Gives an F_SCL of 250 kHz, the rate the reference sampling-engine program
/// runs at and comfortably below the chip's 512 kHz maximum.
pub const CLOCK_HALF_PERIOD_US: u32 = 2;

/// Clock polarity of the serial interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Polarity {
    /// The clock idles low and pulses high (the usual wiring).
    #[default]
    ActiveHigh,
    /// The clock idles high and pulses low.
    ActiveLow,
}

impl Polarity {
    /// (idle, active) line levels, `true` meaning high.
    fn levels(self) -> (bool, bool) {
        match self {
            Polarity::ActiveHigh => (false, true),
            Polarity::ActiveLow => (true, false),
        }
    }
}

/// One attempt to obtain a fresh word from the sensor.
///
/// The backend is chosen once, at construction of the driver, and never
/// changes afterwards.
pub trait Acquire {
    type Error;

    /// Tries to obtain one fresh `bits`-wide sample.
    ///
    /// Returns `Ok(Some(word))` with bit 0 holding the first key clocked out,
    /// or `Ok(None)` if no sample is available yet.
    fn acquire(&mut self, bits: u8) -> Result<Option<u16>, Self::Error>;
}

/// Software-clocked acquisition: toggles the clock line and samples the data
/// line directly, blocking the caller for the duration of the word.
pub struct BitBang<SDO, SCL, D> {
    sdo: SDO,
    scl: SCL,
    delay: D,
    polarity: Polarity,
}

impl<SDO, SCL, D> BitBang<SDO, SCL, D> {
    /// Wraps an already-configured data line (input, pulled up) and clock
    /// line (output). No line is touched until the first acquisition.
    pub fn new(sdo: SDO, scl: SCL, delay: D, polarity: Polarity) -> Self {
        BitBang {
            sdo,
            scl,
            delay,
            polarity,
        }
    }

    /// Hands the two lines back so they can be reused elsewhere.
    pub fn release(self) -> (SDO, SCL) {
        (self.sdo, self.scl)
    }
}

impl<SDO, SCL, D, E> Acquire for BitBang<SDO, SCL, D>
where
    SDO: InputPin<Error = E>,
    SCL: OutputPin<Error = E>,
    D: DelayNs,
{
    type Error = E;

    fn acquire(&mut self, bits: u8) -> Result<Option<u16>, E> {
        let (idle, active) = self.polarity.levels();
        let mut word = 0u16;

        self.scl.set_state(idle.into())?;
        for i in 0..bits {
            self.scl.set_state(active.into())?;
            self.delay.delay_us(CLOCK_HALF_PERIOD_US);
            if self.sdo.is_high()? {
                word |= 1 << i;
            }
            self.scl.set_state(idle.into())?;
            self.delay.delay_us(CLOCK_HALF_PERIOD_US);
        }
        // The clock is left at the active level between words, matching the
        // CircuitPython driver this is ported from.
        self.scl.set_state(active.into())?;

        Ok(Some(word))
    }
}

/// An autonomous hardware sampling engine producing one word per fixed
/// period, such as an RP2040 PIO state machine.
///
/// The engine runs a small clocked program independent of the host: hold the
/// clock at the idle level, then for each of the N bit positions pulse it
/// active-then-idle while capturing the data line once per pulse, push the
/// assembled word into a queue, wait out the chip's ~2 ms settling delay
/// (T_out) and repeat. Polarity and LSB-first bit order must match
/// [`BitBang`] so the two backends are bit-compatible. The reference program
/// clocks the serial line at 250 kHz for a word cycle of ~64 us and a
/// response period of ~2.06 ms.
pub trait SampleEngine {
    type Error;

    /// Number of completed words waiting to be read.
    fn pending_words(&self) -> usize;

    /// Removes and returns the oldest completed word.
    fn dequeue_word(&mut self) -> Result<u16, Self::Error>;
}

/// Hardware-assisted acquisition: a non-blocking check-and-drain of a
/// [`SampleEngine`] word queue.
pub struct Assisted<Q> {
    engine: Q,
}

impl<Q> Assisted<Q> {
    pub fn new(engine: Q) -> Self {
        Assisted { engine }
    }

    /// Hands the sampling engine back so it can be reused elsewhere.
    pub fn release(self) -> Q {
        self.engine
    }
}

impl<Q: SampleEngine> Acquire for Assisted<Q> {
    type Error = Q::Error;

    fn acquire(&mut self, _bits: u8) -> Result<Option<u16>, Q::Error> {
        // The engine's program was configured with the word width; one word
        // per call keeps the drain bounded.
        if self.engine.pending_words() == 0 {
            return Ok(None);
        }
        self.engine.dequeue_word().map(Some)
    }
}
