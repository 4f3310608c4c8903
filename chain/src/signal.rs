// Synchronous publish/subscribe used for the controller's boundary
// signals. Handler failures are logged and swallowed: an observer may
// never affect consensus.

use log::warn;

type Handler<T> = Box<dyn Fn(&T) -> Result<(), Box<dyn std::error::Error>>>;

pub struct Signal<T> {
    name: &'static str,
    subscribers: Vec<Handler<T>>,
}

impl<T> Signal<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            subscribers: Vec::new(),
        }
    }

    pub fn connect<F>(&mut self, handler: F)
    where
        F: Fn(&T) -> Result<(), Box<dyn std::error::Error>> + 'static,
    {
        self.subscribers.push(Box::new(handler));
    }

    pub fn emit(&self, arg: &T) {
        for subscriber in &self.subscribers {
            if let Err(e) = subscriber(arg) {
                warn!("{} signal handler failed: {}", self.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    #[test]
    fn test_all_subscribers_run_despite_failures() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut signal: Signal<u32> = Signal::new("test");

        let first = seen.clone();
        signal.connect(move |value| {
            first.borrow_mut().push(*value);
            Err("handler failure".into())
        });
        let second = seen.clone();
        signal.connect(move |value| {
            second.borrow_mut().push(value + 1);
            Ok(())
        });

        // The failing handler does not stop the rest
        signal.emit(&7);
        assert_eq!(*seen.borrow(), vec![7, 8]);
    }
}
