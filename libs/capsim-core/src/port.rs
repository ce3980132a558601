//! Timing ports with explicit retry
//!
//! Both sides of every link follow the same protocol: a sender that is
//! refused keeps the packet in a single-slot retry register and retransmits
//! it when the peer signals readiness. A response port additionally tracks
//! whether a requester was turned away while the owner was busy, so the
//! requester can be told to resend once the owner drains.

/// Receiving end of a packet link. Refusal hands the packet back.
pub trait PacketSink<P> {
    fn try_recv(&mut self, pkt: P) -> Result<(), P>;
}

/// Request-side port state: one outstanding retry packet at most.
#[derive(Debug)]
pub struct RequestPort<P> {
    name: &'static str,
    retry: Option<P>,
}

impl<P> RequestPort<P> {
    pub fn new(name: &'static str) -> RequestPort<P> {
        RequestPort { name, retry: None }
    }

    /// Whether a new packet may be sent (no stashed retry).
    pub fn can_send(&self) -> bool {
        self.retry.is_none()
    }

    /// Send a packet, stashing it if the peer refuses.
    pub fn try_send(&mut self, pkt: P, peer: &mut dyn PacketSink<P>) {
        assert!(
            self.retry.is_none(),
            "{}: send with retry slot occupied",
            self.name
        );
        if let Err(refused) = peer.try_recv(pkt) {
            self.retry = Some(refused);
        }
    }

    /// Peer signalled readiness: retransmit the stashed packet.
    pub fn recv_retry(&mut self, peer: &mut dyn PacketSink<P>) {
        let pkt = self
            .retry
            .take()
            .unwrap_or_else(|| panic!("{}: retry with empty slot", self.name));
        self.try_send(pkt, peer);
    }
}

/// Response-side port state: retry slot plus a deferred-request flag.
#[derive(Debug)]
pub struct ResponsePort<P> {
    name: &'static str,
    retry: Option<P>,
    to_retry_req: bool,
}

impl<P> ResponsePort<P> {
    pub fn new(name: &'static str) -> ResponsePort<P> {
        ResponsePort {
            name,
            retry: None,
            to_retry_req: false,
        }
    }

    /// Record that a requester was refused and must be told to resend.
    pub fn set_retry_req(&mut self) {
        self.to_retry_req = true;
    }

    /// Send a response. Returns true when the requester should now be told
    /// to resend a previously refused request.
    pub fn try_send_resp(&mut self, pkt: P, peer: &mut dyn PacketSink<P>) -> bool {
        assert!(
            self.retry.is_none(),
            "{}: response with retry slot occupied",
            self.name
        );
        match peer.try_recv(pkt) {
            Err(refused) => {
                self.retry = Some(refused);
                false
            }
            Ok(()) => {
                if self.to_retry_req {
                    self.to_retry_req = false;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Peer signalled readiness for the deferred response.
    pub fn recv_resp_retry(&mut self, peer: &mut dyn PacketSink<P>) -> bool {
        let pkt = self
            .retry
            .take()
            .unwrap_or_else(|| panic!("{}: response retry with empty slot", self.name));
        self.try_send_resp(pkt, peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sink that refuses the first `refuse` packets, then accepts the rest.
    struct FlakySink {
        refuse: usize,
        accepted: Vec<u32>,
    }

    impl PacketSink<u32> for FlakySink {
        fn try_recv(&mut self, pkt: u32) -> Result<(), u32> {
            if self.refuse > 0 {
                self.refuse -= 1;
                Err(pkt)
            } else {
                self.accepted.push(pkt);
                Ok(())
            }
        }
    }

    #[test]
    fn test_request_port_stashes_and_retries() {
        let mut sink = FlakySink {
            refuse: 1,
            accepted: Vec::new(),
        };
        let mut port = RequestPort::new("test.req");

        port.try_send(7, &mut sink);
        assert!(!port.can_send());
        assert!(sink.accepted.is_empty());

        port.recv_retry(&mut sink);
        assert!(port.can_send());
        assert_eq!(sink.accepted, vec![7]);
    }

    #[test]
    fn test_response_port_raises_req_retry_after_drain() {
        let mut sink = FlakySink {
            refuse: 1,
            accepted: Vec::new(),
        };
        let mut port = ResponsePort::new("test.resp");
        port.set_retry_req();

        // First response is refused: stash it, do not raise the retry yet.
        assert!(!port.try_send_resp(9, &mut sink));

        // Once the deferred response drains, the requester gets its retry.
        assert!(port.recv_resp_retry(&mut sink));
        assert_eq!(sink.accepted, vec![9]);
    }

    #[test]
    #[should_panic(expected = "retry slot occupied")]
    fn test_double_send_is_a_protocol_violation() {
        let mut sink = FlakySink {
            refuse: 2,
            accepted: Vec::new(),
        };
        let mut port = RequestPort::new("test.req");
        port.try_send(1, &mut sink);
        port.try_send(2, &mut sink);
    }
}
