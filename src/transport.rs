//! Command posting and event reassembly.
//!
//! Commands are written into buffers the RPU hands out on the command-available
//! queue and posted back on the command-busy queue. Events arrive on the
//! event-busy queue; an event longer than one event buffer is spread over
//! several buffers that arrive back to back. Only the first one carries the
//! message header.

use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::digital::Wait;

use crate::error::{Error, ProtocolViolation, TimeoutKind};
use crate::hpq::HostRpuHPQ;
use crate::messages::{CommandMessage, MessageHeader};
use crate::regs::*;
use crate::{slice8, Bus, LoadState, Processor, Runner};

/// Largest event the host reassembles.
pub(crate) const MAX_EVENT_LEN: usize = 8192;

/// An event whose first fragments have been read but not the last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct PendingEvent {
    pub total_len: usize,
    pub bytes_received: usize,
    /// Taken from the first fragment and applied to every fragment.
    pub resubmit: bool,
    /// Set when the event is being consumed without being buffered. Its
    /// fragments are still freed and the error is reported once the last one
    /// has been seen.
    pub rejected: Option<Error>,
}

/// What one event buffer did to the event being reassembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventProgress {
    Partial,
    Delivered,
    Rejected(Error),
}

impl<'a, BUS: Bus, IN: InputPin + Wait, OUT: OutputPin, D: DelayNs> Runner<'a, BUS, IN, OUT, D> {
    /// Posts `cmd` to the UMAC, split into fragments of the configured size.
    pub(crate) async fn send_command(&mut self, cmd: &CommandMessage) -> Result<(), Error> {
        if self.load_state != LoadState::Booted {
            return Err(Error::InvalidState);
        }

        debug!("send command type={:?} len={}", cmd.msg_type(), cmd.len());
        for fragment in cmd.as_bytes().chunks(self.config.max_cmd_size) {
            self.rpu_cmd_ctrl_send(fragment).await?;
        }
        Ok(())
    }

    async fn rpu_cmd_ctrl_send(&mut self, message: &[u8]) -> Result<(), Error> {
        let info = self.hpqm_info()?;

        // The queue might be full of earlier commands the RPU has not consumed yet.
        let message_address = self.rpu_cmd_slot(info.cmd_avl_queue).await?;

        self.write_bytes(message_address, None, message).await?;
        self.rpu_hpq_enqueue(info.cmd_busy_queue, message_address).await?;
        self.rpu_msg_trigger().await
    }

    async fn rpu_cmd_slot(&mut self, cmd_avl_queue: HostRpuHPQ) -> Result<u32, Error> {
        let poll = self.config.cmd_slot_poll;
        for _ in 0..poll.count {
            if let Some(addr) = self.rpu_hpq_dequeue(cmd_avl_queue).await? {
                return Ok(addr);
            }
            self.sleep(poll.interval).await;
        }
        warn!("no command buffer after {} polls", poll.count);
        Err(Error::Timeout(TimeoutKind::CommandSlot))
    }

    /// Tells the UMAC a command was posted.
    async fn rpu_msg_trigger(&mut self) -> Result<(), Error> {
        self.write32(
            RPU_REG_INT_TO_MCU_CTRL,
            Some(Processor::Umac),
            self.num_commands | 0x7fff0000,
        )
        .await?;
        self.num_commands = self.num_commands.wrapping_add(1);
        Ok(())
    }

    /// Drains the event-busy queue. Returns how many events were completed and
    /// queued for delivery.
    ///
    /// A rejected event does not stop the drain; the first rejection is
    /// returned once the queue is empty. On any other error the event being
    /// reassembled is dropped.
    pub(crate) async fn poll_events(&mut self) -> Result<u32, Error> {
        match self.service_events().await? {
            (completed, None) => Ok(completed),
            (_, Some(e)) => Err(e),
        }
    }

    /// Like [`Runner::poll_events`], but reports the completed count next to
    /// the first rejected event.
    pub(crate) async fn service_events(&mut self) -> Result<(u32, Option<Error>), Error> {
        let res = self.drain_events().await;
        if res.is_err() {
            self.reset_pending_event();
        }
        res
    }

    async fn drain_events(&mut self) -> Result<(u32, Option<Error>), Error> {
        let event_busy_queue = self.hpqm_info()?.event_busy_queue;
        let mut completed = 0;
        let mut rejected = None;
        while let Some(event_address) = self.rpu_hpq_dequeue(event_busy_queue).await? {
            match self.rpu_event_read(event_address).await? {
                EventProgress::Partial => {}
                EventProgress::Delivered => completed += 1,
                EventProgress::Rejected(e) => {
                    rejected.get_or_insert(e);
                }
            }
        }
        Ok((completed, rejected))
    }

    /// Consumes one event buffer.
    async fn rpu_event_read(&mut self, event_address: u32) -> Result<EventProgress, Error> {
        let pending = match self.pending_event.take() {
            Some(mut pending) => {
                let n = (pending.total_len - pending.bytes_received).min(MAX_EVENT_POOL_LEN);
                if pending.rejected.is_none() {
                    self.read_event_bytes(event_address, n).await?;
                }
                pending.bytes_received += n;
                pending
            }
            None => self.rpu_event_start(event_address).await?,
        };

        if pending.resubmit {
            self.rpu_event_free(event_address).await?;
        }

        if pending.bytes_received < pending.total_len {
            trace!("event {}/{} bytes", pending.bytes_received, pending.total_len);
            self.pending_event = Some(pending);
            return Ok(EventProgress::Partial);
        }

        if let Some(e) = pending.rejected {
            return Ok(EventProgress::Rejected(e));
        }
        match self.deliver_event() {
            Ok(()) => Ok(EventProgress::Delivered),
            Err(e) => Ok(EventProgress::Rejected(e)),
        }
    }

    /// Reads the first fragment of an event.
    async fn rpu_event_start(&mut self, event_address: u32) -> Result<PendingEvent, Error> {
        let mut prefix = [0u32; RPU_EVENT_COMMON_SIZE_MAX / 4];
        self.read(event_address, None, &mut prefix).await?;

        let header = MessageHeader {
            len: u32::from_le(prefix[0]),
            resubmit: u32::from_le(prefix[1]),
        };
        let total_len = header.len as usize;
        let resubmit = header.resubmit != 0;
        self.event_buf.clear();

        let rejected: Option<Error> = if total_len < MessageHeader::SIZE {
            Some(ProtocolViolation::EventTooShort(header.len).into())
        } else if header.len > RPU_PKTRAM_SIZE {
            Some(ProtocolViolation::EventTooLong(header.len).into())
        } else if total_len > MAX_EVENT_LEN {
            Some(Error::ResourceExhaustion)
        } else {
            None
        };
        if let Some(e) = rejected {
            warn!("dropping event of {} bytes: {:?}", total_len, e);
            // Only an event that fits in packet RAM has a length worth
            // following; otherwise this buffer is all that is consumed.
            let total_len = match e {
                Error::ResourceExhaustion => total_len,
                _ => MAX_EVENT_POOL_LEN,
            };
            return Ok(PendingEvent {
                total_len,
                bytes_received: MAX_EVENT_POOL_LEN,
                resubmit,
                rejected: Some(e),
            });
        }

        let bytes_received = if total_len > MAX_EVENT_POOL_LEN {
            self.read_event_bytes(event_address, MAX_EVENT_POOL_LEN).await?;
            MAX_EVENT_POOL_LEN
        } else if total_len > RPU_EVENT_COMMON_SIZE_MAX {
            // This is a longer than usual event. We gotta read it again
            self.read_event_bytes(event_address, total_len).await?;
            total_len
        } else {
            self.event_buf
                .extend_from_slice(&slice8(&prefix)[..total_len])
                .map_err(|_| Error::ResourceExhaustion)?;
            total_len
        };

        Ok(PendingEvent {
            total_len,
            bytes_received,
            resubmit,
            rejected: None,
        })
    }

    /// Hands an event buffer back to the RPU.
    async fn rpu_event_free(&mut self, event_address: u32) -> Result<(), Error> {
        let event_avl_queue = self.hpqm_info()?.event_avl_queue;
        self.rpu_hpq_enqueue(event_avl_queue, event_address).await
    }

    fn deliver_event(&mut self) -> Result<(), Error> {
        let len = self.event_buf.len();
        let res = match self.events_tx.grant(len) {
            Ok(mut grant) => {
                grant.copy_from_slice(&self.event_buf[..]);
                grant.commit(len);
                Ok(())
            }
            Err(_) => {
                warn!("event queue full, dropping {} byte event", len);
                Err(Error::ResourceExhaustion)
            }
        };
        self.event_buf.clear();
        res
    }

    pub(crate) fn reset_pending_event(&mut self) {
        self.pending_event = None;
        self.event_buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Poll;
    use crate::messages::RpuMessageType;
    use crate::test_utils::*;
    use embassy_time::Duration;
    use futures::executor::block_on;

    const EVENT_BASE: u32 = 0xB001_0000;

    fn delivered(runner: &mut TestRunner<'_>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(frame) = runner.events_rx.read() {
            out.push(frame.to_vec());
            frame.release();
        }
        out
    }

    fn assert_idle(runner: &TestRunner<'_>) {
        assert_eq!(runner.pending_event, None);
        assert!(runner.event_buf.is_empty());
    }

    #[test]
    fn reassembly_at_fragment_boundaries() {
        for fragments in 1..=5usize {
            let exact = fragments * MAX_EVENT_POOL_LEN;
            for len in [exact - 1, exact, exact + 1] {
                let dev = MockBus::new();
                let mut state = crate::State::new();
                let (_, mut runner) = booted_runner(&mut state, dev.clone());

                let event = event_bytes(len, false);
                let used = dev.post_event(EVENT_BASE, &event);

                assert_eq!(block_on(runner.poll_events()), Ok(1), "len {}", len);
                assert_eq!(used, len.div_ceil(MAX_EVENT_POOL_LEN));
                assert_eq!(delivered(&mut runner), vec![event]);
                assert_idle(&runner);
                assert!(dev.enqueued(test_hpqm_info().event_avl_queue).is_empty());
            }
        }
    }

    #[test]
    fn short_events_come_from_the_prefix_or_a_reread() {
        for len in [8, 12, RPU_EVENT_COMMON_SIZE_MAX, RPU_EVENT_COMMON_SIZE_MAX + 1, 500] {
            let dev = MockBus::new();
            let mut state = crate::State::new();
            let (_, mut runner) = booted_runner(&mut state, dev.clone());

            let event = event_bytes(len, false);
            dev.post_event(EVENT_BASE, &event);

            assert_eq!(block_on(runner.poll_events()), Ok(1));
            assert_eq!(delivered(&mut runner), vec![event]);
            assert_idle(&runner);
        }
    }

    #[test]
    fn resubmit_frees_every_fragment_once() {
        let dev = MockBus::new();
        let mut state = crate::State::new();
        let (_, mut runner) = booted_runner(&mut state, dev.clone());

        let event = event_bytes(3 * MAX_EVENT_POOL_LEN + 10, true);
        let used = dev.post_event(EVENT_BASE, &event);
        assert_eq!(used, 4);

        assert_eq!(block_on(runner.poll_events()), Ok(1));
        let freed = dev.enqueued(test_hpqm_info().event_avl_queue);
        let expected: Vec<u32> = (0..used as u32).map(|i| EVENT_BASE + i * FRAGMENT_STRIDE).collect();
        assert_eq!(freed, expected);
    }

    #[test]
    fn all_queued_events_drain_in_one_poll() {
        let dev = MockBus::new();
        let mut state = crate::State::new();
        let (_, mut runner) = booted_runner(&mut state, dev.clone());

        let events: Vec<Vec<u8>> = [20, 300, 1500, 64, 2 * MAX_EVENT_POOL_LEN]
            .iter()
            .map(|&len| event_bytes(len, true))
            .collect();
        let mut base = EVENT_BASE;
        for event in &events {
            let used = dev.post_event(base, event) as u32;
            base += used * FRAGMENT_STRIDE;
        }

        assert_eq!(block_on(runner.poll_events()), Ok(events.len() as u32));
        assert_eq!(delivered(&mut runner), events);
        assert_eq!(block_on(runner.poll_events()), Ok(0));
    }

    #[test]
    fn fragments_may_span_interrupts() {
        let dev = MockBus::new();
        let mut state = crate::State::new();
        let (_, mut runner) = booted_runner(&mut state, dev.clone());

        let event = event_bytes(2 * MAX_EVENT_POOL_LEN + 5, false);
        let fragments: Vec<&[u8]> = event.chunks(MAX_EVENT_POOL_LEN).collect();

        dev.post_fragment(EVENT_BASE, fragments[0]);
        assert_eq!(block_on(runner.poll_events()), Ok(0));
        assert!(runner.pending_event.is_some());

        dev.post_fragment(EVENT_BASE + FRAGMENT_STRIDE, fragments[1]);
        dev.post_fragment(EVENT_BASE + 2 * FRAGMENT_STRIDE, fragments[2]);
        assert_eq!(block_on(runner.poll_events()), Ok(1));
        assert_eq!(delivered(&mut runner), vec![event]);
        assert_idle(&runner);
    }

    #[test]
    fn bad_lengths_are_protocol_violations() {
        let dev = MockBus::new();
        let mut state = crate::State::new();
        let (_, mut runner) = booted_runner(&mut state, dev.clone());

        dev.post_fragment(EVENT_BASE, &MessageHeader { len: 4, resubmit: 0 }.to_bytes());
        assert_eq!(
            block_on(runner.poll_events()),
            Err(Error::Protocol(ProtocolViolation::EventTooShort(4)))
        );

        let len = RPU_PKTRAM_SIZE + 1;
        dev.post_fragment(EVENT_BASE, &MessageHeader { len, resubmit: 0 }.to_bytes());
        assert_eq!(
            block_on(runner.poll_events()),
            Err(Error::Protocol(ProtocolViolation::EventTooLong(len)))
        );

        assert_idle(&runner);
        assert!(delivered(&mut runner).is_empty());
    }

    #[test]
    fn oversized_event_is_consumed_without_losing_sync() {
        let dev = MockBus::new();
        let mut state = crate::State::new();
        let (_, mut runner) = booted_runner(&mut state, dev.clone());

        let mut oversized = event_bytes(9000, true);
        // A continuation that happens to look like a header must not be taken for one.
        oversized[MAX_EVENT_POOL_LEN..MAX_EVENT_POOL_LEN + 8]
            .copy_from_slice(&MessageHeader { len: 20, resubmit: 0 }.to_bytes());
        let used = dev.post_event(EVENT_BASE, &oversized) as u32;
        assert_eq!(used, 9);
        let next = event_bytes(300, true);
        dev.post_event(EVENT_BASE + used * FRAGMENT_STRIDE, &next);

        assert_eq!(block_on(runner.poll_events()), Err(Error::ResourceExhaustion));

        let freed = dev.enqueued(test_hpqm_info().event_avl_queue);
        let expected: Vec<u32> = (0..=used).map(|i| EVENT_BASE + i * FRAGMENT_STRIDE).collect();
        assert_eq!(freed, expected);
        assert_eq!(delivered(&mut runner), vec![next]);
        assert_idle(&runner);
    }

    #[test]
    fn oversized_event_may_span_interrupts() {
        let dev = MockBus::new();
        let mut state = crate::State::new();
        let (_, mut runner) = booted_runner(&mut state, dev.clone());

        let event = event_bytes(MAX_EVENT_LEN + 1, false);
        let fragments: Vec<&[u8]> = event.chunks(MAX_EVENT_POOL_LEN).collect();
        assert_eq!(fragments.len(), 9);

        for (i, fragment) in fragments[..4].iter().enumerate() {
            dev.post_fragment(EVENT_BASE + i as u32 * FRAGMENT_STRIDE, fragment);
        }
        assert_eq!(block_on(runner.poll_events()), Ok(0));
        assert_eq!(
            runner.pending_event.and_then(|p| p.rejected),
            Some(Error::ResourceExhaustion)
        );
        assert!(runner.event_buf.is_empty());

        for (i, fragment) in fragments.iter().enumerate().skip(4) {
            dev.post_fragment(EVENT_BASE + i as u32 * FRAGMENT_STRIDE, fragment);
        }
        assert_eq!(block_on(runner.poll_events()), Err(Error::ResourceExhaustion));
        assert_idle(&runner);
        assert!(delivered(&mut runner).is_empty());
        assert!(dev.enqueued(test_hpqm_info().event_avl_queue).is_empty());
    }

    #[test]
    fn rejected_headers_still_free_their_buffer() {
        for len in [4, RPU_PKTRAM_SIZE + 1] {
            let dev = MockBus::new();
            let mut state = crate::State::new();
            let (_, mut runner) = booted_runner(&mut state, dev.clone());

            dev.post_fragment(EVENT_BASE, &MessageHeader { len, resubmit: 1 }.to_bytes());
            let next = event_bytes(40, false);
            dev.post_event(EVENT_BASE + FRAGMENT_STRIDE, &next);

            assert!(matches!(block_on(runner.poll_events()), Err(Error::Protocol(_))));
            assert_eq!(dev.enqueued(test_hpqm_info().event_avl_queue), vec![EVENT_BASE]);
            assert_eq!(delivered(&mut runner), vec![next]);
            assert_idle(&runner);
        }
    }

    #[test]
    fn bus_fault_drops_the_partial_event() {
        let dev = MockBus::new();
        let mut state = crate::State::new();
        let (_, mut runner) = booted_runner(&mut state, dev.clone());

        let event = event_bytes(2 * MAX_EVENT_POOL_LEN, false);
        dev.post_event(EVENT_BASE, &event);
        dev.fail_reads_at(bus_addr(EVENT_BASE + FRAGMENT_STRIDE, None));

        assert_eq!(block_on(runner.poll_events()), Err(Error::BusFault));
        assert_idle(&runner);
        assert!(delivered(&mut runner).is_empty());
    }

    #[test]
    fn command_fragments_are_posted_in_order() {
        let dev = MockBus::new();
        let mut state = crate::State::new();
        let config = test_config().with_max_cmd_size(64);
        let (_, mut runner) = booted_runner_with(&mut state, dev.clone(), config);
        let info = test_hpqm_info();

        let payload: Vec<u8> = (0..150u32).map(|i| i as u8).collect();
        let cmd = CommandMessage::new(RpuMessageType::Umac, &payload).unwrap();
        let slots = [0xB000_2000, 0xB000_2400, 0xB000_2800];
        for slot in slots {
            dev.push_queue(info.cmd_avl_queue, slot);
        }

        block_on(runner.send_command(&cmd)).unwrap();

        assert_eq!(dev.enqueued(info.cmd_busy_queue), slots.to_vec());
        let posted: Vec<u8> = slots.iter().flat_map(|&s| dev.bytes(bus_addr(s, None), 64)).collect();
        assert_eq!(&posted[..cmd.len()], cmd.as_bytes());

        let header = MessageHeader::parse(&dev.bytes(bus_addr(slots[0], None), 8)).unwrap();
        assert_eq!(header.len as usize, cmd.len());

        let triggers: Vec<u32> = dev
            .writes()
            .into_iter()
            .filter(|&(addr, _)| addr == bus_addr(RPU_REG_INT_TO_MCU_CTRL, None))
            .map(|(_, val)| val)
            .collect();
        assert_eq!(triggers, vec![0x7fff_dead, 0x7fff_deae, 0x7fff_deaf]);
    }

    #[test]
    fn no_command_slot_times_out() {
        let dev = MockBus::new();
        let mut state = crate::State::new();
        let config = test_config().with_cmd_slot_poll(Poll::new(5, Duration::from_micros(100)));
        let (_, mut runner) = booted_runner_with(&mut state, dev.clone(), config);

        let cmd = CommandMessage::new(RpuMessageType::System, &[1, 2, 3, 4]).unwrap();
        assert_eq!(
            block_on(runner.send_command(&cmd)),
            Err(Error::Timeout(TimeoutKind::CommandSlot))
        );
        assert!(dev.enqueued(test_hpqm_info().cmd_busy_queue).is_empty());
    }

    #[test]
    fn commands_need_a_booted_rpu() {
        let dev = MockBus::new();
        let mut state = crate::State::new();
        let (_, mut runner) = fresh_runner(&mut state, dev.clone());

        let cmd = CommandMessage::new(RpuMessageType::System, &[]).unwrap();
        assert_eq!(block_on(runner.send_command(&cmd)), Err(Error::InvalidState));
        assert!(dev.writes().is_empty());
    }
}
