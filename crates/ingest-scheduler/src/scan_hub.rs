//! Drives one scan pass over every knowledge base.
//!
//! One background worker per base (bounded by the configured maximum)
//! iterates the resource module's event stream and hands each event over
//! to the main thread through a [`Waker`] rendezvous; only the main thread
//! touches the state machine. A per-event done-handshake carries back
//! whether the machine accepted the event, so a failing base aborts its
//! own scan without disturbing the others.

use std::sync::Arc;

use corpus_types::interruption::Interruption;
use corpus_types::modules::ResourceModule;
use corpus_types::resources::{KnowledgeBase, ResourceEvent, Updating};

use crate::machine::StateMachine;
use crate::reporter::EventReporter;
use crate::waker::Waker;
use crate::Result;

enum ScanMessage {
    Task(ScanTask),
    /// One per base, pushed when its scan worker is done.
    AllScanned,
}

struct ScanTask {
    event: ResourceEvent,
    /// Receives `true` when the machine rejected the event and the scan
    /// must stop.
    done: crossbeam_channel::Sender<bool>,
}

pub(crate) struct ScanHub {
    reporter: EventReporter,
    interruption: Interruption,
}

impl ScanHub {
    pub fn new(reporter: EventReporter, interruption: Interruption) -> ScanHub {
        ScanHub { reporter, interruption }
    }

    /// Scan every base, funnelling the resource events into the machine.
    pub fn run(&self, machine: &mut StateMachine, workers: usize) -> Result<()> {
        machine.goto_scanning();
        let bases = machine.knowledge_bases()?;
        if bases.is_empty() {
            return Ok(());
        }

        let mut scans = Vec::with_capacity(bases.len());
        for base in bases {
            let module = machine.resource_module(&base.resource_module)?;
            scans.push((base, module));
        }

        let count = scans.len();
        let workers = workers.min(count).max(1);
        let waker = Waker::new();

        std::thread::scope(|scope| {
            let (feed_sender, feed_receiver) = crossbeam_channel::unbounded();
            for scan in scans {
                let _ = feed_sender.send(scan);
            }
            drop(feed_sender);

            for _ in 0..workers {
                let feed_receiver = feed_receiver.clone();
                let waker = &waker;
                scope.spawn(move || {
                    while let Ok((base, module)) = feed_receiver.recv() {
                        self.scan_base(waker, &base, &module);
                    }
                });
            }

            self.drain_events(machine, &waker, count)
        })
    }

    /// Runs on the main thread: applies the handed-over events until every
    /// base announced the end of its scan.
    fn drain_events(
        &self,
        machine: &mut StateMachine,
        waker: &Waker<ScanMessage>,
        mut remaining: usize,
    ) -> Result<()> {
        while remaining > 0 {
            match waker.receive()? {
                ScanMessage::Task(task) => {
                    let applied = match task.event.updating {
                        Updating::Create | Updating::Update => {
                            machine.put_resource(task.event.id, &task.event.resource, &task.event.path)
                        }
                        Updating::Delete => machine.remove_resource(task.event.id, &task.event.resource),
                    };
                    let interrupted = match applied {
                        Ok(()) => self.interruption.is_interrupted(),
                        Err(e) => {
                            tracing::error!(
                                "failed to apply resource event {} of base {}: {e}",
                                task.event.id,
                                task.event.resource.base
                            );
                            true
                        }
                    };
                    let _ = task.done.send(interrupted);
                }
                ScanMessage::AllScanned => remaining -= 1,
            }
        }
        Ok(())
    }

    // runs on a scan worker thread
    fn scan_base(
        &self,
        waker: &Waker<ScanMessage>,
        base: &KnowledgeBase,
        module: &Arc<dyn ResourceModule>,
    ) {
        let scan_id = self.reporter.report_scan_begin(base.id);
        let outcome = self.drive_scan(waker, base, module);
        let _ = waker.push(ScanMessage::AllScanned);
        if let Err(e) = module.complete_scanning(base) {
            tracing::error!("failed to complete the scan of base {}: {e}", base.id);
        }
        match outcome {
            Ok(()) => self.reporter.report_scan_complete(scan_id, base.id),
            Err(e) => {
                tracing::error!("the scan of base {} aborted: {e}", base.id);
                self.reporter.report_scan_fail(scan_id, base.id, &e);
            }
        }
    }

    fn drive_scan(
        &self,
        waker: &Waker<ScanMessage>,
        base: &KnowledgeBase,
        module: &Arc<dyn ResourceModule>,
    ) -> Result<()> {
        let events = module.scan(base)?;
        for event in events {
            self.interruption.check()?;
            let event = event?;
            let (done_sender, done_receiver) = crossbeam_channel::bounded(1);
            waker.push(ScanMessage::Task(ScanTask { event: event.clone(), done: done_sender }))?;
            let interrupted = done_receiver.recv().unwrap_or(true);
            if interrupted {
                break;
            }
            self.reporter.report_resource_event(&event);
            module.complete_event(&event)?;
        }
        Ok(())
    }
}
