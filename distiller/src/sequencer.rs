use std::sync::{Condvar, Mutex};

/// Ticket turnstile: job `n` enters only after jobs `0..n` have left.
///
/// Jobs still run in parallel everywhere else. Only the steps whose outcome
/// depends on order (dedup, shard appends) pass through a sequencer, which
/// keeps the output identical whatever the worker count.
pub struct Sequencer {
    next: Mutex<usize>,
    turn: Condvar,
}

/// Holding this means it is the owner's turn. Dropping it lets the next ticket in.
pub struct Ticket<'a> {
    seq: &'a Sequencer,
    ticket: usize,
}

impl Sequencer {
    pub fn new() -> Self {
        Self {
            next: Mutex::new(0),
            turn: Condvar::new(),
        }
    }

    /// Block until it is `ticket`'s turn.
    pub fn wait(&self, ticket: usize) -> Ticket<'_> {
        let mut next = self.next.lock().unwrap_or_else(|p| p.into_inner());
        while *next < ticket {
            next = self.turn.wait(next).unwrap_or_else(|p| p.into_inner());
        }
        Ticket { seq: self, ticket }
    }

    /// Give up a turn without entering, e.g. for a job that produced nothing.
    pub fn skip(&self, ticket: usize) {
        drop(self.wait(ticket));
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        let mut next = self.seq.next.lock().unwrap_or_else(|p| p.into_inner());
        if *next == self.ticket {
            *next += 1;
        }
        self.seq.turn.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn tickets_enter_in_order() {
        let seq = Arc::new(Sequencer::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..6)
            .rev()
            .map(|ticket| {
                let seq = Arc::clone(&seq);
                let order = Arc::clone(&order);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(5 * (6 - ticket as u64)));
                    let _turn = seq.wait(ticket);
                    order.lock().unwrap().push(ticket);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn skipped_tickets_release_the_next() {
        let seq = Sequencer::new();
        seq.skip(0);
        let turn = seq.wait(1);
        drop(turn);
        seq.skip(2);
        let _turn = seq.wait(3);
    }
}
