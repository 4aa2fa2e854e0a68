//! Exchange
//!
//! One command out, and when asked for, one reassembled reply back.
//!

use log::{debug, trace, warn};

use super::bulk;
use super::transport::{self, Transport};
use crate::constants::misc::{COMMAND_TERMINATOR, HEADER_SIZE, MAX_REPLY_FRAMES};
use crate::error::Error;
use crate::types::BTag;

/// Command bytes that fit in one outbound frame, header and padding included
pub fn chunk_capacity(block_size: usize) -> usize {
    (block_size / 4 * 4).saturating_sub(HEADER_SIZE).max(4)
}

/// ### Send
///
/// Terminate `text` with a newline and write it as one or more frames. Only the frame carrying
/// the final byte has the end of message bit set.
///
pub fn send<T: Transport + ?Sized>(transport: &mut T, btag: &mut BTag, text: &str) -> Result<(), Error> {
    let mut message = String::with_capacity(text.len() + 1);
    message.push_str(text);
    message.push(COMMAND_TERMINATOR);
    let data = message.as_bytes();

    let capacity = chunk_capacity(transport::block_size(&*transport));
    let num_chunks = data.len().div_ceil(capacity);
    debug!("send {:?} in {} frame(s)", text, num_chunks);

    for (chunk_number, chunk) in data.chunks(capacity).enumerate() {
        let frame = bulk::build_outbound_chunk(btag.next(), chunk, chunk_number + 1 == num_chunks);
        transport::bulk_write(transport, &frame)?;
    }

    Ok(())
}

/// ### Receive
///
/// Ask for the reply with a single tag and keep reading until a frame carries the end of message
/// bit. Payloads are concatenated in arrival order. A device that never sets the bit fails the
/// reply after `MAX_REPLY_FRAMES` frames.
///
pub fn receive<T: Transport + ?Sized>(transport: &mut T, btag: &mut BTag) -> Result<Vec<u8>, Error> {
    receive_bounded(transport, btag, MAX_REPLY_FRAMES)
}

fn receive_bounded<T: Transport + ?Sized>(
    transport: &mut T,
    btag: &mut BTag,
    max_frames: usize,
) -> Result<Vec<u8>, Error> {
    let requested = transport::block_size(&*transport).saturating_sub(HEADER_SIZE);
    let request = bulk::build_inbound_request(btag.next(), requested as u32);

    let mut response: Vec<u8> = Vec::new();
    let mut frames = 0;
    loop {
        if frames == max_frames {
            warn!("giving up on a reply after {frames} frames and {} bytes", response.len());
            return Err(Error::UnterminatedReply(frames));
        }
        frames += 1;

        transport::bulk_write(transport, &request)?;
        let frame = transport::bulk_read(transport)?;

        let header = bulk::parse_inbound_header(&frame)?;
        let payload = bulk::inbound_payload(&frame, &header);
        trace!(
            "reply chunk: declared {}, got {}, eom {}",
            header.declared_len,
            payload.len(),
            header.end_of_message
        );
        response.extend_from_slice(payload);

        if header.end_of_message {
            break;
        }
    }

    debug!("received {} bytes", response.len());
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::transport::mock::{reply_frame, MockTransport};

    fn payload_of(frame: &[u8]) -> &[u8] {
        let len = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
        &frame[HEADER_SIZE..HEADER_SIZE + len]
    }

    #[test]
    fn short_command_is_one_frame() {
        let mut transport = MockTransport::new(64);
        let mut btag = BTag::new();

        send(&mut transport, &mut btag, "*CLS").unwrap();

        let writes = transport.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0][0], 1);
        assert_eq!(writes[0][1], 1);
        assert_eq!(writes[0][8], 1);
        assert_eq!(payload_of(&writes[0]), b"*CLS\n");
    }

    #[test]
    fn long_command_is_chunked() {
        for max_packet in [64usize, 512, 1024] {
            let mut transport = MockTransport::new(max_packet);
            let mut btag = BTag::new();
            let command: String = (0..1500).map(|i| (b'A' + (i % 26) as u8) as char).collect();

            send(&mut transport, &mut btag, &command).unwrap();

            let block = max_packet.min(512);
            let capacity = chunk_capacity(block);
            let expected = (command.len() + 1).div_ceil(capacity);
            let writes = transport.writes();
            assert_eq!(writes.len(), expected);

            let mut rebuilt = Vec::new();
            for (n, frame) in writes.iter().enumerate() {
                assert!(frame.len() <= block);
                assert_eq!(frame.len() % 4, 0);
                assert_eq!(frame[1], n as u8 + 1);
                assert_eq!(frame[2], frame[1] ^ 0xFF);
                assert_eq!(frame[8] == 1, n + 1 == writes.len());
                rebuilt.extend_from_slice(payload_of(frame));
            }
            assert_eq!(rebuilt, format!("{command}\n").into_bytes());
            assert_eq!(writes.iter().filter(|f| f[8] != 0).count(), 1);
        }
    }

    #[test]
    fn exact_multiple_sets_eom_on_last_frame() {
        let mut transport = MockTransport::new(64);
        let mut btag = BTag::new();
        // 103 characters plus the terminator fill two 52 byte chunks
        let command = "X".repeat(103);

        send(&mut transport, &mut btag, &command).unwrap();

        let writes = transport.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0][8], 0);
        assert_eq!(writes[1][8], 1);
        assert_eq!(writes[1].len(), 64);
    }

    #[test]
    fn tags_continue_across_calls_and_wrap() {
        let mut transport = MockTransport::new(64);
        let mut btag = BTag::new();
        for _ in 0..254 {
            btag.next();
        }

        send(&mut transport, &mut btag, &"Y".repeat(120)).unwrap();

        let tags: Vec<u8> = transport.writes().iter().map(|f| f[1]).collect();
        assert_eq!(tags, vec![255, 1, 2]);
    }

    #[test]
    fn reassembles_until_end_of_message() {
        let a = vec![b'a'; 20];
        let b = vec![b'b'; 52];
        let c = vec![b'c'; 7];
        let mut transport = MockTransport::new(64)
            .reply(reply_frame(1, &a, false))
            .reply(reply_frame(1, &b, false))
            .reply(reply_frame(1, &c, true))
            .reply(reply_frame(1, b"never read", true));
        let mut btag = BTag::new();

        let response = receive(&mut transport, &mut btag).unwrap();

        assert_eq!(response.len(), a.len() + b.len() + c.len());
        assert_eq!(response, [a, b, c].concat());
        assert_eq!(transport.replies.len(), 1);

        let writes = transport.writes();
        assert_eq!(writes.len(), 3);
        for request in &writes {
            assert_eq!(request, &vec![2, 1, 0xFE, 0, 52, 0, 0, 0, 0, 0, 0, 0]);
        }
    }

    #[test]
    fn receive_uses_one_tag() {
        let mut transport = MockTransport::new(512).reply(reply_frame(9, b"1", true));
        let mut btag = BTag::new();
        btag.next();

        receive(&mut transport, &mut btag).unwrap();

        assert_eq!(btag.current(), 2);
        assert_eq!(&transport.writes()[0][..8], &[2, 2, 0xFD, 0, 0xF4, 0x01, 0, 0]);
    }

    #[test]
    fn receive_fails_on_truncated_reply() {
        let mut transport = MockTransport::new(64).reply(vec![2, 1, 0xFE]);
        let mut btag = BTag::new();

        assert!(matches!(
            receive(&mut transport, &mut btag),
            Err(Error::TruncatedFrame(3))
        ));
    }

    #[test]
    fn receive_gives_up_without_end_of_message() {
        let mut transport = MockTransport::new(64);
        for _ in 0..4 {
            transport = transport.reply(reply_frame(1, b"more", false));
        }
        let mut btag = BTag::new();

        let err = receive_bounded(&mut transport, &mut btag, 3).unwrap_err();

        assert!(matches!(err, Error::UnterminatedReply(3)));
        assert!(err.is_transport());
        assert_eq!(transport.writes().len(), 3);
        assert_eq!(transport.replies.len(), 1);
    }

    #[test]
    fn receive_times_out_without_reply() {
        let mut transport = MockTransport::new(64);
        let mut btag = BTag::new();

        let err = receive(&mut transport, &mut btag).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
