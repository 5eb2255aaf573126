//! HCI packet framing
//!
//! Command packets are `[0x01][opcode lo][opcode hi][plen][params...]`. The
//! controller answers with an event packet `[0x04][event code][plen][params]`,
//! either Command Complete (carrying the return parameters) or Command Status.
//! Event decoding and opcode correlation are done with `bt-hci`.

use bt_hci::event::Event;
use bt_hci::FromHciBytes;
use stepcast_core::{HciError, Opcode, RawCommand};

/// Packet type indicator for commands
pub const HCI_COMMAND_PKT: u8 = 0x01;
/// Packet type indicator for events
pub const HCI_EVENT_PKT: u8 = 0x04;
/// Command Complete event code
pub const EVT_CMD_COMPLETE: u8 = 0x0E;
/// Command Status event code
pub const EVT_CMD_STATUS: u8 = 0x0F;
/// Largest event packet: indicator, header and 255 parameter bytes
pub const HCI_MAX_EVENT_SIZE: usize = 3 + 255;

/// What an incoming event means for a pending command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEvent {
    /// Command Complete for our opcode, with its return parameters
    Complete(Vec<u8>),
    /// Command Status for our opcode
    Status(u8),
    /// Some other event or another command's completion
    Unrelated,
}

/// Frame a command packet
pub fn encode_command(command: &RawCommand) -> Result<Vec<u8>, HciError> {
    let plen = u8::try_from(command.params.len()).map_err(|_| {
        HciError::TransportError(format!(
            "command parameters too long: {}",
            command.params.len()
        ))
    })?;

    let mut packet = Vec::with_capacity(4 + command.params.len());
    packet.push(HCI_COMMAND_PKT);
    packet.extend_from_slice(&command.opcode.to_raw().to_le_bytes());
    packet.push(plen);
    packet.extend_from_slice(&command.params);
    Ok(packet)
}

/// Classify an event packet read from the socket
pub fn parse_event(packet: &[u8], opcode: Opcode) -> Result<CommandEvent, HciError> {
    let truncated =
        || HciError::TransportError(format!("truncated event packet: {} bytes", packet.len()));

    let [indicator, body @ ..] = packet else {
        return Err(truncated());
    };
    if *indicator != HCI_EVENT_PKT {
        return Ok(CommandEvent::Unrelated);
    }
    let [code, plen, ..] = body else {
        return Err(truncated());
    };
    if *code != EVT_CMD_COMPLETE && *code != EVT_CMD_STATUS {
        return Ok(CommandEvent::Unrelated);
    }

    let (event, _) = Event::from_hci_bytes(body).map_err(|e| {
        HciError::TransportError(format!("malformed event 0x{:02x}: {:?}", code, e))
    })?;
    let params = body.get(2..2 + usize::from(*plen)).ok_or_else(truncated)?;

    match event {
        // [ncmd][opcode lo][opcode hi][return params...]
        Event::CommandComplete(complete) if complete.cmd_opcode == opcode => Ok(
            CommandEvent::Complete(params.get(3..).unwrap_or_default().to_vec()),
        ),
        // [status][ncmd][opcode lo][opcode hi]
        Event::CommandStatus(status) if status.cmd_opcode == opcode => {
            if status.status.to_result().is_ok() {
                Ok(CommandEvent::Status(0x00))
            } else {
                params.first().copied().map(CommandEvent::Status).ok_or_else(truncated)
            }
        }
        _ => Ok(CommandEvent::Unrelated),
    }
}

/// Read events until the completion for `opcode` arrives.
///
/// `read_event` fills the buffer with one event packet and returns its length.
/// Unrelated events and a successful Command Status are skipped; a failed
/// Command Status ends the wait.
pub fn read_completion<R>(opcode: Opcode, mut read_event: R) -> Result<Vec<u8>, HciError>
where
    R: FnMut(&mut [u8]) -> Result<usize, HciError>,
{
    let mut buf = [0u8; HCI_MAX_EVENT_SIZE];
    loop {
        let n = read_event(&mut buf)?;
        let packet = buf.get(..n).ok_or_else(|| {
            HciError::TransportError(format!("event length {} exceeds buffer", n))
        })?;

        match parse_event(packet, opcode)? {
            CommandEvent::Complete(params) => return Ok(params),
            CommandEvent::Status(0) | CommandEvent::Unrelated => continue,
            CommandEvent::Status(status) => return Err(HciError::NonSuccessStatus(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;

    use stepcast_core::{OpcodeGroup, READ_ADDRESS_OPCODE};
    use tokio_test::assert_err;

    const ADDRESS_COMPLETE: [u8; 13] = [
        0x04, 0x0E, 0x0A, 0x01, 0x09, 0x10, 0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF,
    ];
    // Completion for HCI_Reset
    const RESET_COMPLETE: [u8; 7] = [0x04, 0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00];

    fn command_status(status: u8) -> Vec<u8> {
        vec![0x04, 0x0F, 0x04, status, 0x01, 0x09, 0x10]
    }

    /// Feeds queued packets to `read_completion`, then times out
    fn scripted(packets: Vec<Vec<u8>>) -> impl FnMut(&mut [u8]) -> Result<usize, HciError> {
        let mut queue: VecDeque<Vec<u8>> = packets.into();
        move |buf: &mut [u8]| match queue.pop_front() {
            Some(packet) => {
                buf[..packet.len()].copy_from_slice(&packet);
                Ok(packet.len())
            }
            None => Err(HciError::Timeout { ms: 10 }),
        }
    }

    #[test]
    fn test_encode_read_address() {
        assert_eq!(
            encode_command(&RawCommand::read_address()).unwrap(),
            vec![0x01, 0x09, 0x10, 0x00]
        );
        let reset = Opcode::new(OpcodeGroup::new(0x03), 0x003);
        assert_err!(encode_command(&RawCommand::new(reset, vec![0u8; 256])));
    }

    #[test]
    fn test_command_complete_for_our_opcode() {
        assert_eq!(
            parse_event(&ADDRESS_COMPLETE, READ_ADDRESS_OPCODE).unwrap(),
            CommandEvent::Complete(vec![0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF])
        );
    }

    #[test]
    fn test_other_events_are_unrelated() {
        assert_eq!(
            parse_event(&RESET_COMPLETE, READ_ADDRESS_OPCODE).unwrap(),
            CommandEvent::Unrelated
        );
        // Disconnection complete
        let disconnect = [0x04, 0x05, 0x04, 0x00, 0x40, 0x00, 0x13];
        assert_eq!(
            parse_event(&disconnect, READ_ADDRESS_OPCODE).unwrap(),
            CommandEvent::Unrelated
        );
    }

    #[test]
    fn test_command_status() {
        assert_eq!(
            parse_event(&command_status(0x01), READ_ADDRESS_OPCODE).unwrap(),
            CommandEvent::Status(0x01)
        );
        assert_eq!(
            parse_event(&command_status(0x00), READ_ADDRESS_OPCODE).unwrap(),
            CommandEvent::Status(0x00)
        );
    }

    #[test]
    fn test_truncated_packets() {
        assert_err!(parse_event(&[], READ_ADDRESS_OPCODE));
        assert_err!(parse_event(&[0x04], READ_ADDRESS_OPCODE));
        assert_err!(parse_event(&[0x04, 0x0E], READ_ADDRESS_OPCODE));
        assert_err!(parse_event(&[0x04, 0x0E, 0x0A, 0x01, 0x09], READ_ADDRESS_OPCODE));
    }

    #[test]
    fn test_completion_skips_unrelated_and_pending_status() {
        let read = scripted(vec![
            RESET_COMPLETE.to_vec(),
            command_status(0x00),
            ADDRESS_COMPLETE.to_vec(),
        ]);
        assert_eq!(
            read_completion(READ_ADDRESS_OPCODE, read).unwrap(),
            vec![0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]
        );
    }

    #[test]
    fn test_completion_fails_on_error_status() {
        let read = scripted(vec![command_status(0x0C), ADDRESS_COMPLETE.to_vec()]);
        assert_eq!(
            read_completion(READ_ADDRESS_OPCODE, read),
            Err(HciError::NonSuccessStatus(0x0C))
        );
    }

    #[test]
    fn test_completion_propagates_read_errors() {
        let read = scripted(vec![RESET_COMPLETE.to_vec()]);
        assert_eq!(
            read_completion(READ_ADDRESS_OPCODE, read),
            Err(HciError::Timeout { ms: 10 })
        );
    }
}
