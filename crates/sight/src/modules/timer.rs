// Timer - Emits `timeout` periodically while started
//
// A helper thread waits on a channel with a timeout. Every elapsed period
// posts `timeout` to the connected slots; dropping the sender ends the
// thread.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use sight_com::Signal;
use sight_service::{Declarations, Service, ServiceContext, ServiceError, ServiceResult};

pub const TIMEOUT_SIG: &str = "timeout";

#[derive(Debug, Default)]
pub struct Timer {
    period: Duration,
    one_shot: bool,
    timeout: Option<Signal<()>>,
    running: Option<(Sender<()>, JoinHandle<()>)>,
}

impl Service for Timer {
    fn declare(&mut self, decl: &mut Declarations<'_, Self>) {
        self.timeout = Some(decl.signal(TIMEOUT_SIG));
    }

    fn configuring(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        let config = ctx.config();
        let period_ms: u64 = config.get_or("period_ms", 1000)?;
        if period_ms == 0 {
            return Err(ServiceError::Configuration("'period_ms' must be positive".into()));
        }
        self.period = Duration::from_millis(period_ms);
        self.one_shot = config.get_or("one_shot", false)?;
        Ok(())
    }

    fn starting(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        let Some(timeout) = self.timeout.clone() else {
            return Err(ServiceError::Precondition("timeout signal not declared".into()));
        };
        let (period, one_shot) = (self.period, self.one_shot);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name(format!("{}-timer", ctx.uid()))
            .spawn(move || loop {
                match stop_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        timeout.async_emit(());
                        if one_shot {
                            break;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| ServiceError::Runtime(format!("cannot spawn timer thread: {e}")))?;

        self.running = Some((stop_tx, handle));
        tracing::debug!(service = %ctx.uid(), period_ms = period.as_millis() as u64, one_shot, "Timer started");
        Ok(())
    }

    fn updating(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }

    fn stopping(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        let Some((stop_tx, handle)) = self.running.take() else {
            return Ok(());
        };
        drop(stop_tx);
        if handle.join().is_err() {
            tracing::warn!(service = %ctx.uid(), "Timer thread panicked");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use sight_com::{HasSignals, Slot};
    use sight_service::{ApplicationContext, ServiceConfig, ServiceObject};
    use std::sync::Arc;

    #[test]
    fn test_one_shot_fires_once_on_receiver_worker() {
        let app = ApplicationContext::new().unwrap();
        let receiver = app.workers().get_or_spawn("receiver").unwrap().0;
        let timer = app.add_service("timer", Timer::default()).unwrap();

        timer
            .set_configuration(ServiceConfig::new(json!({ "period_ms": 10, "one_shot": true })))
            .unwrap();
        timer.configure().unwrap();

        let fired = Arc::new(Mutex::new(Vec::new()));
        let slot = {
            let fired = Arc::clone(&fired);
            Slot::with_worker(receiver.clone(), move |()| fired.lock().push(std::thread::current().id()))
        };
        let signal = timer.signals().get::<()>(TIMEOUT_SIG).unwrap();
        let _connection = signal.connect(&slot).unwrap();

        timer.start().wait().unwrap();
        // Long enough for one period, stopping then joins the helper thread
        std::thread::sleep(Duration::from_millis(50));
        timer.stop().wait().unwrap();
        receiver.post_task(|| ()).unwrap().wait().unwrap();

        assert_eq!(*fired.lock(), vec![receiver.thread_id()]);
        app.shutdown();
    }

    #[test]
    fn test_zero_period_is_rejected() {
        let app = ApplicationContext::new().unwrap();
        let timer = app.add_service("timer", Timer::default()).unwrap();
        timer
            .set_configuration(ServiceConfig::new(json!({ "period_ms": 0 })))
            .unwrap();

        assert!(timer.configure().is_err());
        app.shutdown();
    }

    #[test]
    fn test_stop_ends_periodic_timer() {
        let app = ApplicationContext::new().unwrap();
        let timer = app.add_service("timer", Timer::default()).unwrap();
        timer
            .set_configuration(ServiceConfig::new(json!({ "period_ms": 5 })))
            .unwrap();
        timer.configure().unwrap();

        timer.start().wait().unwrap();
        timer.stop().wait().unwrap();
        assert!(timer.with(|t| t.running.is_none()).unwrap());
        app.shutdown();
    }
}
