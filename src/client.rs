//! Asynchronous client for a JBD BMS connection.
//!
//! The client owns the write side of the link and the protocol state of one
//! connection. Notification chunks from the device are handed to the
//! [`NotificationSink`] returned by [`JbdBms::notification_sink`].
//!
//! # Example
//!
//! ```no_run
//! use jbdbms_lib::client::JbdBms;
//! use jbdbms_lib::protocol::Switch;
//! # use jbdbms_lib::transport::Transport;
//!
//! # async fn run<T: Transport>(transport: T) -> jbdbms_lib::Result<()> {
//! let bms = JbdBms::new(transport);
//! // Connect bms.notification_sink() to the notification characteristic here
//!
//! let sample = bms.fetch().await?;
//! println!("{:.2}V {:.2}A {}%", sample.voltage, sample.current, sample.soc);
//!
//! let voltages = bms.fetch_voltages().await?;
//! println!("Cell voltages: {voltages:?}");
//!
//! bms.set_switch(Switch::Discharge, false).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::dispatcher::Dispatcher;
use crate::protocol::*;
use crate::transport::{NotificationSink, Transport};
use crate::Result;

/// Tunables of a [`JbdBms`] connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long a request waits for its response.
    pub timeout: Duration,
    /// Reject responses whose checksum does not match.
    pub verify_checksum: bool,
    /// Wait for the device to acknowledge MOSFET switch commands.
    ///
    /// Without it a switch command is written and assumed to have been applied.
    pub await_switch_ack: bool,
    /// Upper bound for a partially received frame.
    pub max_frame_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(16),
            verify_checksum: true,
            await_switch_ack: true,
            max_frame_len: MAX_FRAME_LENGTH,
        }
    }
}

/// One connection to a JBD BMS.
///
/// Requests are issued one at a time: a request holds the transport until its
/// response arrived or it timed out, since responses can only be told apart by
/// their echoed command code.
pub struct JbdBms<T> {
    transport: tokio::sync::Mutex<T>,
    dispatcher: Arc<Dispatcher>,
    switches: Mutex<Option<SwitchState>>, // Last known MOSFET state
    config: ClientConfig,
}

impl<T: Transport> JbdBms<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, ClientConfig::default())
    }

    pub fn with_config(transport: T, config: ClientConfig) -> Self {
        Self {
            transport: tokio::sync::Mutex::new(transport),
            dispatcher: Arc::new(Dispatcher::new(
                config.max_frame_len,
                config.verify_checksum,
            )),
            switches: Mutex::new(None),
            config,
        }
    }

    /// The handle notification chunks from the device have to be pushed into.
    pub fn notification_sink(&self) -> NotificationSink {
        NotificationSink::new(Arc::clone(&self.dispatcher))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        log::trace!("set timeout to {timeout:?}");
        self.config.timeout = timeout;
    }

    /// Sends a read request for `command` and returns the complete response frame.
    ///
    /// Fails with [`Error::Timeout`](crate::Error::Timeout) if no frame echoing
    /// `command` arrives within `timeout`. A partially received frame is dropped
    /// in that case so it cannot be mistaken for the start of the next response.
    pub async fn request(&self, command: u8, timeout: Duration) -> Result<Vec<u8>> {
        self.exchange(command, &encode_read(command), timeout).await
    }

    async fn exchange(&self, command: u8, tx_buffer: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let mut transport = self.transport.lock().await;
        self.exchange_locked(&mut transport, command, tx_buffer, timeout)
            .await
    }

    /// Like `exchange`, for callers already holding the transport.
    async fn exchange_locked(
        &self,
        transport: &mut T,
        command: u8,
        tx_buffer: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let waiter = self.dispatcher.register(command)?;
        log::trace!("write bytes: {tx_buffer:02X?}");
        transport.write(tx_buffer).await?;
        waiter.wait(timeout).await
    }

    /// Reads the basic info block and remembers the reported MOSFET state.
    pub async fn fetch(&self) -> Result<BmsSample> {
        let mut transport = self.transport.lock().await;
        self.fetch_locked(&mut transport).await
    }

    // The switch cache is only touched while the transport is held, so it
    // always reflects the last exchange that completed.
    async fn fetch_locked(&self, transport: &mut T) -> Result<BmsSample> {
        log::trace!("get basic info");
        let rx_buffer = self
            .exchange_locked(
                transport,
                CMD_BASIC_INFO,
                &BasicInfo::request(),
                self.config.timeout,
            )
            .await?;
        let sample = BasicInfo::decode(&rx_buffer)?;
        self.store_switches(sample.switches);
        Ok(sample)
    }

    /// Reads the voltage of every cell in mV.
    pub async fn fetch_voltages(&self) -> Result<CellVoltageList> {
        log::trace!("get cell voltages");
        let rx_buffer = self
            .request(CMD_CELL_VOLTAGES, self.config.timeout)
            .await?;
        CellVoltages::decode(&rx_buffer)
    }

    /// Turns one MOSFET on or off, leaving the other one as last observed.
    ///
    /// The basic info block is fetched first if the current state is not known yet.
    /// Concurrent switch commands are applied one after the other, each starting
    /// from the state the previous one left behind.
    pub async fn set_switch(&self, switch: Switch, enable: bool) -> Result<()> {
        let mut transport = self.transport.lock().await;
        let current = match self.switch_state() {
            Some(switches) => switches,
            None => self.fetch_locked(&mut transport).await?.switches,
        };
        let target = current.with(switch, enable);
        let tx_buffer = MosfetControl::request(target.control_byte())?;
        log::info!("set {switch} mosfet to {enable}: {tx_buffer:02X?}");

        if self.config.await_switch_ack {
            let rx_buffer = self
                .exchange_locked(
                    &mut transport,
                    CMD_MOSFET_CONTROL,
                    &tx_buffer,
                    self.config.timeout,
                )
                .await?;
            MosfetControl::decode(&rx_buffer)?;
        } else {
            log::trace!("write bytes: {tx_buffer:02X?}");
            transport.write(&tx_buffer).await?;
        }

        self.store_switches(target);
        Ok(())
    }

    /// Like [`set_switch`](Self::set_switch) with the switch given by name.
    pub async fn set_switch_by_name(&self, switch: &str, enable: bool) -> Result<()> {
        let switch: Switch = switch.parse()?;
        self.set_switch(switch, enable).await
    }

    /// The MOSFET state seen by the last fetch or switch command.
    pub fn switch_state(&self) -> Option<SwitchState> {
        *self.switches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store_switches(&self, switches: SwitchState) {
        *self.switches.lock().unwrap_or_else(PoisonError::into_inner) = Some(switches);
    }

    /// The most recent complete frame received, valid or not.
    pub fn last_response(&self) -> Option<Vec<u8>> {
        self.dispatcher.last_response()
    }

    pub fn into_transport(self) -> T {
        self.transport.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tests::{basic_info_payload, response};
    use crate::Error;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    #[derive(Default)]
    struct MockState {
        sink: Option<NotificationSink>,
        // Chunks to deliver after each write, consumed in order
        replies: VecDeque<Vec<Vec<u8>>>,
        sent: Vec<(Instant, Vec<u8>)>,
        fail_writes: bool,
    }

    #[derive(Clone, Default)]
    struct MockTransport {
        state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        fn reply(&self, chunks: Vec<Vec<u8>>) {
            self.state.lock().unwrap().replies.push_back(chunks);
        }

        fn sent(&self) -> Vec<Vec<u8>> {
            let state = self.state.lock().unwrap();
            state.sent.iter().map(|(_, bytes)| bytes.clone()).collect()
        }

        fn sent_at(&self) -> Vec<Instant> {
            let state = self.state.lock().unwrap();
            state.sent.iter().map(|(at, _)| *at).collect()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn write(&mut self, data: &[u8]) -> Result<()> {
            let (sink, chunks) = {
                let mut state = self.state.lock().unwrap();
                if state.fail_writes {
                    return Err(Error::Transport("write rejected".into()));
                }
                state.sent.push((Instant::now(), data.to_vec()));
                (state.sink.clone(), state.replies.pop_front())
            };
            if let (Some(sink), Some(chunks)) = (sink, chunks) {
                for chunk in chunks {
                    sink.push(&chunk);
                }
            }
            Ok(())
        }
    }

    fn client(config: ClientConfig) -> (JbdBms<MockTransport>, MockTransport) {
        let mock = MockTransport::default();
        let bms = JbdBms::with_config(mock.clone(), config);
        mock.state.lock().unwrap().sink = Some(bms.notification_sink());
        (bms, mock)
    }

    fn basic_info(mos: u8) -> Vec<u8> {
        response(CMD_BASIC_INFO, &basic_info_payload(300, 100, mos, &[2981]))
    }

    fn voltages() -> Vec<u8> {
        response(
            CMD_CELL_VOLTAGES,
            &[0x0C, 0xE4, 0x0C, 0xE4, 0x0C, 0xE4, 0x0C, 0xE4],
        )
    }

    fn ack() -> Vec<u8> {
        response(CMD_MOSFET_CONTROL, &[])
    }

    #[tokio::test]
    async fn fetch_decodes_and_caches_switches() {
        let (bms, mock) = client(ClientConfig::default());
        let frame = basic_info(2);
        mock.reply(vec![frame[..20].to_vec(), frame[20..].to_vec()]);

        let sample = bms.fetch().await.unwrap();
        assert_eq!(sample.voltage, 3.00);
        assert_eq!(sample.current, -1.00);
        assert_eq!(sample.temperatures, vec![25.0]);
        assert_eq!(mock.sent(), vec![BasicInfo::request()]);
        assert_eq!(
            bms.switch_state(),
            Some(SwitchState {
                charge: false,
                discharge: true
            })
        );
        assert_eq!(bms.last_response(), Some(frame));
    }

    #[tokio::test]
    async fn fetch_voltages_from_single_byte_notifications() {
        let (bms, mock) = client(ClientConfig::default());
        mock.reply(voltages().into_iter().map(|b| vec![b]).collect());

        assert_eq!(
            bms.fetch_voltages().await.unwrap(),
            vec![3300, 3300, 3300, 3300]
        );
        assert_eq!(mock.sent(), vec![CellVoltages::request()]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_resets_buffer_and_next_request_succeeds() {
        let timeout = Duration::from_secs(16);
        let (bms, mock) = client(ClientConfig::default());
        // Only the start of a frame ever arrives
        mock.reply(vec![vec![0xDD, 0x03, 0x00, 0x1B, 0x0A]]);

        let started = Instant::now();
        let result = bms.request(CMD_BASIC_INFO, timeout).await;
        assert!(matches!(result, Err(Error::Timeout)));
        let elapsed = started.elapsed();
        assert!(elapsed >= timeout && elapsed < timeout + Duration::from_millis(5));
        assert_eq!(bms.dispatcher.buffered_len(), 0);
        assert_eq!(bms.dispatcher.pending(), 0);

        mock.reply(vec![voltages()]);
        assert_eq!(bms.fetch_voltages().await.unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn response_for_other_command_does_not_resolve() {
        let (bms, mock) = client(ClientConfig::default());
        mock.reply(vec![voltages()]);

        let result = bms.request(CMD_BASIC_INFO, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn checksum_mismatch_is_rejected() {
        let (bms, mock) = client(ClientConfig::default());
        let mut frame = voltages();
        frame[5] = 0xE5;
        mock.reply(vec![frame]);

        assert!(matches!(
            bms.fetch_voltages().await,
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn checksum_check_can_be_disabled() {
        let (bms, mock) = client(ClientConfig {
            verify_checksum: false,
            ..ClientConfig::default()
        });
        let mut frame = voltages();
        frame[5] = 0xE5;
        mock.reply(vec![frame]);

        assert_eq!(
            bms.fetch_voltages().await.unwrap(),
            vec![3301, 3300, 3300, 3300]
        );
    }

    #[tokio::test]
    async fn failed_write_releases_waiter() {
        let (bms, mock) = client(ClientConfig::default());
        mock.state.lock().unwrap().fail_writes = true;
        assert!(matches!(bms.fetch().await, Err(Error::Transport(_))));
        assert_eq!(bms.dispatcher.pending(), 0);

        mock.state.lock().unwrap().fail_writes = false;
        mock.reply(vec![basic_info(3)]);
        assert!(bms.fetch().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_request_releases_waiter() {
        let (bms, mock) = client(ClientConfig::default());
        mock.reply(vec![vec![0xDD, 0x03]]);

        let abandoned = tokio::time::timeout(
            Duration::from_secs(1),
            bms.request(CMD_BASIC_INFO, Duration::from_secs(16)),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(bms.dispatcher.pending(), 0);
        assert_eq!(bms.dispatcher.buffered_len(), 0);

        mock.reply(vec![basic_info(0)]);
        assert!(bms.fetch().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_are_serialized() {
        let (bms, mock) = client(ClientConfig::default());
        // The basic info response shows up late, the voltages respond at once
        mock.reply(vec![]);
        mock.reply(vec![voltages()]);
        let sink = bms.notification_sink();
        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            sink.push(&basic_info(3));
        });

        let started = Instant::now();
        let (sample, cells) = tokio::join!(bms.fetch(), bms.fetch_voltages());
        late.await.unwrap();

        assert!(sample.is_ok());
        assert_eq!(cells.unwrap().len(), 4);
        assert_eq!(
            mock.sent(),
            vec![BasicInfo::request(), CellVoltages::request()]
        );
        let sent_at = mock.sent_at();
        assert!(sent_at[1] - started >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_for_same_command_queue_up() {
        let (bms, mock) = client(ClientConfig::default());
        mock.reply(vec![]);
        mock.reply(vec![basic_info(3)]);
        let sink = bms.notification_sink();
        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            sink.push(&basic_info(3));
        });

        let (first, second) = tokio::join!(bms.fetch(), bms.fetch());
        late.await.unwrap();

        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(mock.sent().len(), 2);
    }

    #[tokio::test]
    async fn set_switch_fetches_unknown_state_first() {
        let (bms, mock) = client(ClientConfig::default());
        mock.reply(vec![basic_info(3)]);
        mock.reply(vec![ack()]);

        bms.set_switch(Switch::Discharge, false).await.unwrap();
        assert_eq!(
            mock.sent(),
            vec![
                BasicInfo::request(),
                MosfetControl::request(0x02).unwrap()
            ]
        );
        assert_eq!(
            bms.switch_state(),
            Some(SwitchState {
                charge: true,
                discharge: false
            })
        );
    }

    #[tokio::test]
    async fn set_switch_uses_cached_state() {
        let (bms, mock) = client(ClientConfig::default());
        mock.reply(vec![basic_info(0)]);
        bms.fetch().await.unwrap();

        mock.reply(vec![ack()]);
        bms.set_switch(Switch::Charge, true).await.unwrap();
        mock.reply(vec![ack()]);
        bms.set_switch(Switch::Discharge, true).await.unwrap();

        let sent = mock.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1], MosfetControl::request(0x02).unwrap());
        assert_eq!(sent[2], MosfetControl::request(0x00).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn set_switch_without_ack_times_out() {
        let (bms, mock) = client(ClientConfig::default());
        mock.reply(vec![basic_info(3)]);
        bms.fetch().await.unwrap();

        assert!(matches!(
            bms.set_switch(Switch::Charge, false).await,
            Err(Error::Timeout)
        ));
        // The state is only updated once the device confirmed it
        assert_eq!(
            bms.switch_state(),
            Some(SwitchState {
                charge: true,
                discharge: true
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_switch_commands_build_on_each_other() {
        let (bms, mock) = client(ClientConfig::default());
        mock.reply(vec![basic_info(3)]);
        bms.fetch().await.unwrap();

        // The first acknowledgement is late, the second one immediate
        mock.reply(vec![]);
        mock.reply(vec![ack()]);
        let sink = bms.notification_sink();
        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            sink.push(&ack());
        });

        let (charge_off, discharge_off) = tokio::join!(
            bms.set_switch(Switch::Charge, false),
            bms.set_switch(Switch::Discharge, false)
        );
        late.await.unwrap();
        charge_off.unwrap();
        discharge_off.unwrap();

        let sent = mock.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1], MosfetControl::request(0x01).unwrap());
        assert_eq!(sent[2], MosfetControl::request(0x03).unwrap());
        assert_eq!(bms.switch_state(), Some(SwitchState::default()));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_waits_for_pending_switch_command() {
        let (bms, mock) = client(ClientConfig::default());
        mock.reply(vec![basic_info(3)]);
        bms.fetch().await.unwrap();

        // The device reports the new state only after acknowledging the switch
        mock.reply(vec![]);
        mock.reply(vec![basic_info(2)]);
        let sink = bms.notification_sink();
        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            sink.push(&ack());
        });

        let (switched, sample) =
            tokio::join!(bms.set_switch(Switch::Charge, false), bms.fetch());
        late.await.unwrap();
        switched.unwrap();
        assert_eq!(
            sample.unwrap().switches,
            SwitchState {
                charge: false,
                discharge: true
            }
        );
        assert_eq!(
            bms.switch_state(),
            Some(SwitchState {
                charge: false,
                discharge: true
            })
        );
    }

    #[tokio::test]
    async fn set_switch_fire_and_forget() {
        let (bms, mock) = client(ClientConfig {
            await_switch_ack: false,
            ..ClientConfig::default()
        });
        mock.reply(vec![basic_info(1)]);
        bms.fetch().await.unwrap();

        bms.set_switch(Switch::Charge, false).await.unwrap();
        assert_eq!(mock.sent()[1], MosfetControl::request(0x03).unwrap());
        assert_eq!(bms.switch_state(), Some(SwitchState::default()));
    }

    #[tokio::test]
    async fn unknown_switch_name_sends_nothing() {
        let (bms, mock) = client(ClientConfig::default());
        let result = bms.set_switch_by_name("balance", true).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert!(mock.sent().is_empty());
    }
}
