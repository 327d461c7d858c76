use std::{
    io::ErrorKind,
    net::{SocketAddr, UdpSocket},
    thread,
    time::Duration,
};

use tracing::{debug, info, warn};

use super::{Movement, MovementExecutor};
use crate::{BeatSyncError, Result};

/// Default command endpoint of the drone's access point.
pub const DEFAULT_ADDRESS: &str = "192.168.10.1:8889";

const ROTATION_RANGE: std::ops::RangeInclusive<u32> = 1..=360;
const DISTANCE_RANGE: std::ops::RangeInclusive<u32> = 20..=500;

/// Hardware-backed executor speaking the Tello text SDK over UDP.
///
/// Every command is a single datagram; the drone answers `ok` or an error
/// string. A missing reply within the timeout counts as a failure, and a
/// reply that turns up later is discarded before the next command.
#[derive(Debug)]
pub struct TelloExecutor {
    address: SocketAddr,
    timeout: Duration,
    /// Pause after takeoff before the first movement.
    settle_delay: Duration,
    socket: Option<UdpSocket>,
}

impl TelloExecutor {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            timeout: Duration::from_secs(7),
            settle_delay: Duration::from_secs(1),
            socket: None,
        }
    }

    pub fn with_default_address() -> Result<Self> {
        let address = DEFAULT_ADDRESS
            .parse()
            .map_err(|err| BeatSyncError::config(format!("bad drone address: {err}")))?;
        Ok(Self::new(address))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    fn socket(&mut self) -> Result<&UdpSocket> {
        if self.socket.is_none() {
            let socket = UdpSocket::bind("0.0.0.0:0")?;
            socket.connect(self.address)?;
            socket.set_read_timeout(Some(self.timeout))?;
            self.socket = Some(socket);
        }
        self.socket
            .as_ref()
            .ok_or_else(|| BeatSyncError::actuation("drone socket unavailable"))
    }

    /// Sends one SDK command and returns the drone's trimmed reply.
    pub fn query(&mut self, command: &str) -> Result<String> {
        let address = self.address;
        let socket = self.socket()?;
        discard_stale_replies(socket)?;

        debug!(%address, command, "drone command");
        socket
            .send(command.as_bytes())
            .map_err(|err| BeatSyncError::actuation(format!("send `{command}` failed: {err}")))?;

        let mut reply = [0_u8; 256];
        let len = socket
            .recv(&mut reply)
            .map_err(|err| BeatSyncError::actuation(format!("no reply to `{command}`: {err}")))?;
        Ok(String::from_utf8_lossy(&reply[..len]).trim().to_string())
    }

    /// Sends one SDK command and expects `ok`.
    pub fn send_command(&mut self, command: &str) -> Result<()> {
        let reply = self.query(command)?;
        if reply.eq_ignore_ascii_case("ok") {
            Ok(())
        } else {
            Err(BeatSyncError::actuation(format!(
                "drone rejected `{command}`: {reply}"
            )))
        }
    }

    /// Battery charge in percent.
    pub fn battery(&mut self) -> Result<u8> {
        let reply = self.query("battery?")?;
        reply
            .parse()
            .map_err(|_| BeatSyncError::actuation(format!("unexpected battery reply: {reply}")))
    }
}

fn discard_stale_replies(socket: &UdpSocket) -> Result<()> {
    socket.set_nonblocking(true)?;
    let mut buf = [0_u8; 256];
    let mut discarded = 0;
    loop {
        match socket.recv(&mut buf) {
            Ok(_) => discarded += 1,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    socket.set_nonblocking(false)?;
    if discarded > 0 {
        debug!(discarded, "late drone replies discarded");
    }
    Ok(())
}

fn check_range(movement: &Movement) -> Result<()> {
    let (value, range) = match movement {
        Movement::RotateClockwise { degrees } | Movement::RotateCounterClockwise { degrees } => {
            (*degrees, ROTATION_RANGE)
        }
        Movement::Flip { .. } => return Ok(()),
        other => (other.parameter().unwrap_or_default(), DISTANCE_RANGE),
    };

    if range.contains(&value) {
        Ok(())
    } else {
        Err(BeatSyncError::actuation(format!(
            "`{movement}` outside supported range {}..={}",
            range.start(),
            range.end()
        )))
    }
}

impl MovementExecutor for TelloExecutor {
    fn name(&self) -> &str {
        "tello"
    }

    fn begin_performance(&mut self) -> Result<()> {
        self.send_command("command")?;
        match self.battery() {
            Ok(percent) => info!(address = %self.address, battery = percent, "drone connected"),
            Err(err) => warn!(address = %self.address, error = %err, "battery level unavailable"),
        }

        info!("taking off");
        self.send_command("takeoff")?;
        thread::sleep(self.settle_delay);
        Ok(())
    }

    fn execute(&mut self, movement: &Movement) -> Result<()> {
        check_range(movement)?;
        self.send_command(&movement.to_string())
    }

    fn end_performance(&mut self) -> Result<()> {
        info!("landing");
        self.send_command("land")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn rejects_out_of_range_moves_before_sending() {
        assert!(check_range(&Movement::RotateClockwise { degrees: 30 }).is_ok());
        assert!(check_range(&Movement::RotateClockwise { degrees: 0 }).is_err());
        assert!(check_range(&Movement::Up { cm: 10 }).is_err());
        assert!(check_range(&Movement::Forward { cm: 600 }).is_err());
    }

    #[test]
    fn talks_to_a_udp_peer() {
        let drone = UdpSocket::bind("127.0.0.1:0").unwrap();
        let address = drone.local_addr().unwrap();
        let responder = thread::spawn(move || {
            let mut buf = [0_u8; 64];
            let mut seen = Vec::new();
            for reply in ["ok", "error Not joystick"] {
                let (len, peer) = drone.recv_from(&mut buf).unwrap();
                seen.push(String::from_utf8_lossy(&buf[..len]).to_string());
                drone.send_to(reply.as_bytes(), peer).unwrap();
            }
            seen
        });

        let mut executor = TelloExecutor::new(address).with_timeout(Duration::from_secs(2));
        executor
            .execute(&Movement::RotateClockwise { degrees: 30 })
            .unwrap();
        let err = executor.execute(&Movement::Up { cm: 20 }).unwrap_err();
        assert!(format!("{err}").contains("Not joystick"));

        assert_eq!(responder.join().unwrap(), vec!["cw 30", "up 20"]);
    }

    #[test]
    fn begin_reads_battery_then_settles_after_takeoff() {
        let drone = UdpSocket::bind("127.0.0.1:0").unwrap();
        let address = drone.local_addr().unwrap();
        let responder = thread::spawn(move || {
            let mut buf = [0_u8; 64];
            let mut seen = Vec::new();
            for reply in ["ok", "87", "ok"] {
                let (len, peer) = drone.recv_from(&mut buf).unwrap();
                seen.push(String::from_utf8_lossy(&buf[..len]).to_string());
                drone.send_to(reply.as_bytes(), peer).unwrap();
            }
            seen
        });

        let mut executor = TelloExecutor::new(address)
            .with_timeout(Duration::from_secs(2))
            .with_settle_delay(Duration::from_millis(80));
        let started = Instant::now();
        executor.begin_performance().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(80));

        assert_eq!(responder.join().unwrap(), vec!["command", "battery?", "takeoff"]);
    }

    #[test]
    fn late_reply_is_not_taken_for_the_next_answer() {
        let drone = UdpSocket::bind("127.0.0.1:0").unwrap();
        let address = drone.local_addr().unwrap();
        let responder = thread::spawn(move || {
            let mut buf = [0_u8; 64];
            let (_, peer) = drone.recv_from(&mut buf).unwrap();
            thread::sleep(Duration::from_millis(200));
            drone.send_to(b"ok", peer).unwrap();

            let (len, peer) = drone.recv_from(&mut buf).unwrap();
            drone.send_to(b"error Motor stop", peer).unwrap();
            String::from_utf8_lossy(&buf[..len]).to_string()
        });

        let mut executor = TelloExecutor::new(address).with_timeout(Duration::from_millis(100));
        assert!(executor.send_command("cw 30").is_err());
        thread::sleep(Duration::from_millis(300));

        let err = executor.send_command("up 20").unwrap_err();
        assert!(format!("{err}").contains("Motor stop"));
        assert_eq!(responder.join().unwrap(), "up 20");
    }
}
