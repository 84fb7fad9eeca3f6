//! Two-node PLC MAC simulation.
//! Runs a sender and a receiver over an in-memory medium, exercising
//! segmentation, CSMA/CA and acknowledgements without hardware.
//
// https://github.com/rust-iot/rust-plc-mac
// Copyright 2021 Ryan Kurte

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};

use structopt::StructOpt;

use rand::rngs::OsRng;

use plc_mac::prelude::*;
use plc_mac::phy::{PhyEvent, PhyTxStatus};

#[derive(Debug, StructOpt)]
struct Options {
    #[structopt(long, default_value = "100")]
    /// Set PAN ID
    pub pan_id: u16,

    #[structopt(long, default_value = "300")]
    /// Payload size per transfer in bytes
    pub size: usize,

    #[structopt(long, default_value = "10")]
    /// Number of transfers to run
    pub count: usize,

    #[structopt(long, default_value = "info")]
    /// Configure log level
    pub log_level: simplelog::LevelFilter,
}

#[derive(Clone, Debug)]
pub struct SystemTimer {
    start: Instant,
}

impl SystemTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl MacTimer for SystemTimer {
    fn ticks_ms(&self) -> u64 {
        Instant::now().duration_since(self.start).as_millis() as u64
    }

    fn ticks_us(&self) -> u64 {
        Instant::now().duration_since(self.start).as_micros() as u64
    }
}

/// Shared in-memory medium, delivering frames and acknowledgements
/// between the two nodes
#[derive(Default)]
struct Medium {
    inboxes: [VecDeque<PhyEvent>; 2],
}

/// One node's attachment to the medium
struct SimPhy {
    id: usize,
    medium: Rc<RefCell<Medium>>,
}

impl SimPhy {
    fn pair() -> (SimPhy, SimPhy) {
        let medium = Rc::new(RefCell::new(Medium::default()));
        (
            SimPhy {
                id: 0,
                medium: medium.clone(),
            },
            SimPhy { id: 1, medium },
        )
    }
}

impl Phy for SimPhy {
    type Error = core::convert::Infallible;

    fn tx_request(&mut self, data: &[u8], at: u64, _sense: bool) -> Result<(), Self::Error> {
        let mut m = self.medium.borrow_mut();

        debug!("Node {} transmits {} bytes at {} us", self.id, data.len(), at);

        m.inboxes[1 - self.id].push_back(PhyEvent::DataIndication {
            data: heapless::Vec::from_slice(data).unwrap(),
            time: at,
            ack_requested: true,
        });
        m.inboxes[self.id].push_back(PhyEvent::TxConfirm {
            status: PhyTxStatus::Success,
            time: at,
        });

        Ok(())
    }

    fn ack_request(&mut self, kind: AckKind, fcs: u16, _more: bool, at: u64) -> Result<(), Self::Error> {
        let mut m = self.medium.borrow_mut();

        debug!("Node {} acknowledges {:04x} at {} us", self.id, fcs, at);

        m.inboxes[1 - self.id].push_back(PhyEvent::AckIndication {
            kind,
            fcs,
            long_fail: false,
        });

        Ok(())
    }

    fn set_params(&mut self, params: &PhyParams) -> Result<(), Self::Error> {
        debug!("Node {} params: {} over {:?}", self.id, params.modulation, params.band);
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<PhyEvent>, Self::Error> {
        Ok(self.medium.borrow_mut().inboxes[self.id].pop_front())
    }
}

#[derive(Default)]
struct Handler {
    confirms: Vec<(TxOutcome, Modulation)>,
    received: usize,
}

impl MacHandler for Handler {
    fn tx_confirm(&mut self, outcome: TxOutcome, modulation: Modulation) {
        info!("Transfer concluded: {} ({})", outcome, modulation);
        self.confirms.push((outcome, modulation));
    }

    fn data_indication(&mut self, frame: &Frame) {
        debug!("Received seq {} segment {} ({} bytes)", frame.seq, frame.seg.count, frame.payload().len());
        self.received += frame.payload().len();
    }
}

fn main() -> Result<(), anyhow::Error> {
    let opts = Options::from_args();

    simplelog::SimpleLogger::init(opts.log_level, simplelog::Config::default())?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || r.store(false, Ordering::SeqCst))?;

    let (phy_a, phy_b) = SimPhy::pair();
    let timer = SystemTimer::new();

    let mut sender = MacRt::new(
        phy_a,
        timer.clone(),
        OsRng,
        Handler::default(),
        AddressConfig::new(opts.pan_id, 0x0001),
        MacConfig::default(),
        CsmaConfig::default(),
    );
    let mut receiver = MacRt::new(
        phy_b,
        timer,
        OsRng,
        Handler::default(),
        AddressConfig::new(opts.pan_id, 0x0002),
        MacConfig::default(),
        CsmaConfig::default(),
    );

    info!("Starting simulation, {} transfers of {} bytes", opts.count, opts.size);

    let payload = vec![0xa5u8; opts.size];
    let mut submitted = 0;

    while running.load(Ordering::SeqCst) {
        if submitted == sender.handler().confirms.len() && submitted < opts.count {
            let mut req = TxRequest::new(opts.pan_id, Address::Short(0x0002), &payload).unwrap();
            req.ack_request = true;

            sender.transmit(req).map_err(|e| anyhow::anyhow!("transmit: {:?}", e))?;
            submitted += 1;
        }

        sender.tick().map_err(|e| anyhow::anyhow!("sender: {:?}", e))?;
        receiver.tick().map_err(|e| anyhow::anyhow!("receiver: {:?}", e))?;

        if sender.handler().confirms.len() >= opts.count {
            break;
        }

        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    info!(
        "Done: {} transfers concluded, {} bytes delivered",
        sender.handler().confirms.len(),
        receiver.handler().received,
    );

    Ok(())
}
