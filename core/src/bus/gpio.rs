//! Physical Raspberry Pi GPIO bus backend, built on `rppal`. Pin numbers
//! match the add-on board wiring; real boards additionally buffer/invert
//! these lines in hardware, which `rppal`'s `Level` abstraction hides from us.

use anyhow::{Context, Result};
use rppal::gpio::{Gpio, InputPin, Level, OutputPin};

use super::{Bus, Signal};

const PIN_BSY: u8 = 4;
const PIN_SEL: u8 = 17;
const PIN_ATN: u8 = 27;
const PIN_ACK: u8 = 22;
const PIN_RST: u8 = 10;
const PIN_MSG: u8 = 9;
const PIN_CD: u8 = 11;
const PIN_IO: u8 = 5;
const PIN_REQ: u8 = 6;
const PIN_DAT_BASE: u8 = 12;

struct SignalPins {
    bsy: OutputPin,
    sel: InputPin,
    atn: InputPin,
    ack: InputPin,
    rst: InputPin,
    msg: OutputPin,
    cd: OutputPin,
    io: OutputPin,
    req: OutputPin,
}

/// A GPIO-backed bus operating in target mode. The wire uses negative logic
/// (a pulled-down line reads as asserted); this type inverts at the edge so
/// every other layer can work in positive logic.
pub struct GpioBus {
    gpio: Gpio,
    pins: SignalPins,
    dat_out: [OutputPin; 8],
    snapshot_dat: u8,
    snapshot: [bool; 9],
}

impl GpioBus {
    pub fn open() -> Result<Self> {
        let gpio = Gpio::new().context("failed to open /dev/gpiomem")?;

        let pins = SignalPins {
            bsy: gpio.get(PIN_BSY)?.into_output(),
            sel: gpio.get(PIN_SEL)?.into_input(),
            atn: gpio.get(PIN_ATN)?.into_input(),
            ack: gpio.get(PIN_ACK)?.into_input(),
            rst: gpio.get(PIN_RST)?.into_input(),
            msg: gpio.get(PIN_MSG)?.into_output(),
            cd: gpio.get(PIN_CD)?.into_output(),
            io: gpio.get(PIN_IO)?.into_output(),
            req: gpio.get(PIN_REQ)?.into_output(),
        };

        let mut dat_out_vec = Vec::with_capacity(8);
        for i in 0..8u8 {
            dat_out_vec.push(gpio.get(PIN_DAT_BASE + i)?.into_output());
        }
        let dat_out: [OutputPin; 8] = dat_out_vec
            .try_into()
            .unwrap_or_else(|_| unreachable!("exactly 8 DAT pins were pushed"));

        Ok(Self {
            gpio,
            pins,
            dat_out,
            snapshot_dat: 0,
            snapshot: [false; 9],
        })
    }
}

const fn idx(signal: Signal) -> usize {
    match signal {
        Signal::Bsy => 0,
        Signal::Sel => 1,
        Signal::Atn => 2,
        Signal::Ack => 3,
        Signal::Rst => 4,
        Signal::Msg => 5,
        Signal::Cd => 6,
        Signal::Io => 7,
        Signal::Req => 8,
    }
}

fn asserted(level: Level) -> bool {
    // Negative logic on the wire: asserted == driven low.
    level == Level::Low
}

impl Bus for GpioBus {
    fn acquire(&mut self) {
        self.snapshot[idx(Signal::Sel)] = asserted(self.pins.sel.read());
        self.snapshot[idx(Signal::Atn)] = asserted(self.pins.atn.read());
        self.snapshot[idx(Signal::Ack)] = asserted(self.pins.ack.read());
        self.snapshot[idx(Signal::Rst)] = asserted(self.pins.rst.read());
        // Output-driven lines reflect what we last wrote; BSY is the only
        // output we also read back for `get_signal`.
        self.snapshot[idx(Signal::Bsy)] = self.pins.bsy.is_set_low();
        self.snapshot[idx(Signal::Msg)] = self.pins.msg.is_set_low();
        self.snapshot[idx(Signal::Cd)] = self.pins.cd.is_set_low();
        self.snapshot[idx(Signal::Io)] = self.pins.io.is_set_low();
        self.snapshot[idx(Signal::Req)] = self.pins.req.is_set_low();
    }

    fn get_signal(&self, signal: Signal) -> bool {
        self.snapshot[idx(signal)]
    }

    fn set_signal(&mut self, signal: Signal, value: bool) {
        let drive_low = value;
        match signal {
            Signal::Bsy => self.pins.bsy.write(if drive_low { Level::Low } else { Level::High }),
            Signal::Msg => self.pins.msg.write(if drive_low { Level::Low } else { Level::High }),
            Signal::Cd => self.pins.cd.write(if drive_low { Level::Low } else { Level::High }),
            Signal::Io => self.pins.io.write(if drive_low { Level::Low } else { Level::High }),
            Signal::Req => self.pins.req.write(if drive_low { Level::Low } else { Level::High }),
            // ATN/ACK/RST/SEL are initiator-driven and read-only on the target side.
            Signal::Atn | Signal::Ack | Signal::Rst | Signal::Sel => {}
        }
        self.snapshot[idx(signal)] = value;
    }

    fn get_dat(&self) -> u8 {
        self.snapshot_dat
    }

    fn set_dat(&mut self, value: u8) {
        for (i, pin) in self.dat_out.iter_mut().enumerate() {
            let bit = (value >> i) & 1 != 0;
            pin.write(if bit { Level::Low } else { Level::High });
        }
        self.snapshot_dat = value;
    }

    fn reset(&mut self) {
        self.pins.bsy.set_high();
        self.pins.msg.set_high();
        self.pins.cd.set_high();
        self.pins.io.set_high();
        self.pins.req.set_high();
        for pin in &mut self.dat_out {
            pin.set_high();
        }
        self.snapshot = [false; 9];
        self.snapshot_dat = 0;
    }

    fn wait_for_selection(&mut self) -> bool {
        loop {
            self.acquire();
            if self.get_signal(Signal::Rst) {
                return false;
            }
            if self.get_signal(Signal::Sel) {
                return true;
            }
            super::busy_wait(std::time::Duration::from_micros(100));
        }
    }
}

impl Drop for GpioBus {
    fn drop(&mut self) {
        // Leave the gpiomem handle for the OS to reclaim; rppal pins revert
        // to their default (input) mode when dropped.
        let _ = &self.gpio;
    }
}
