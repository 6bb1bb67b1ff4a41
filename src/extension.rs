//! The extension pipeline: negotiation and transform hooks that run between
//! the application payload and the frame codec.
//!
//! An [`Extension`] participates in the opening handshake (offer, response,
//! activation) and may transform outgoing and incoming messages and frames.
//! Every hook has an identity default, so an extension only implements the
//! stages it cares about. The [`Pipeline`] chains extensions: outgoing data
//! passes through the stages in registration order, incoming data in reverse
//! order.
//!
//! The concrete `permessage-deflate` implementation lives in
//! [`crate::deflate`]. All pipeline hooks run on the connection's own task,
//! one message at a time per direction, so an extension can keep stream
//! state (dictionaries, counters) in plain fields.

use bytes::Bytes;

use crate::{
    frame::{Frame, OpCode},
    Result,
};

/// Hooks an extension can implement. Absent hooks behave as the identity.
pub trait Extension: Send {
    /// Header token identifying the extension, e.g. `permessage-deflate`.
    fn name(&self) -> &str;

    /// Whether the extension has been negotiated and claims the RSV1 bit on
    /// outgoing/incoming data frames.
    fn rsv1(&self) -> bool {
        false
    }

    /// Client side: produces this extension's `Sec-WebSocket-Extensions`
    /// offer, or `None` to stay silent.
    fn generate_offer(&mut self) -> Option<String> {
        None
    }

    /// Server side: inspects the client's offer header and produces the
    /// parameter list to echo, or `None` to decline.
    fn generate_response(&mut self, _offer: &str) -> Result<Option<String>> {
        Ok(None)
    }

    /// Client side: applies the parameters the server echoed. An error here
    /// aborts the connection attempt.
    fn activate(&mut self, _response: &str) -> Result<()> {
        Ok(())
    }

    /// Transforms a whole outgoing message before it is split into frames.
    ///
    /// Returns the transformed payload and whether RSV1 must be set on the
    /// message's opening frame.
    fn process_outgoing_message(&mut self, _opcode: OpCode, payload: Bytes) -> Result<(Bytes, bool)> {
        Ok((payload, false))
    }

    /// Transforms a whole reassembled incoming message. `compressed` is the
    /// RSV1 bit of the message's opening frame.
    fn process_incoming_message(&mut self, payload: Bytes, _compressed: bool) -> Result<Bytes> {
        Ok(payload)
    }

    /// Transforms a single outgoing frame after message-level processing.
    fn process_outgoing_frame(&mut self, frame: Frame) -> Result<Frame> {
        Ok(frame)
    }

    /// Transforms a single incoming frame before reassembly.
    fn process_incoming_frame(&mut self, frame: Frame) -> Result<Frame> {
        Ok(frame)
    }

    /// Releases any per-connection resources. Called once when the
    /// connection reaches its terminal state.
    fn close(&mut self) {}
}

/// An ordered chain of extensions owned by one connection.
///
/// Outgoing hooks run front to back, incoming hooks back to front, so a
/// stage always sees data in the same shape in both directions.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Extension>>,
}

impl Pipeline {
    /// Creates an empty pipeline (all operations are the identity).
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage to the chain.
    pub fn push(&mut self, stage: Box<dyn Extension>) {
        self.stages.push(stage);
    }

    /// Whether the pipeline has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Whether any stage claims the RSV1 bit.
    pub fn rsv1(&self) -> bool {
        self.stages.iter().any(|stage| stage.rsv1())
    }

    /// Collects the stages' offers into one header value.
    pub(crate) fn generate_offer(&mut self) -> Option<String> {
        let offers: Vec<String> = self
            .stages
            .iter_mut()
            .filter_map(|stage| stage.generate_offer())
            .collect();
        if offers.is_empty() {
            None
        } else {
            Some(offers.join(", "))
        }
    }

    /// Hands the client's offer header to each stage and collects the
    /// accepted parameter lists.
    pub(crate) fn generate_response(&mut self, offer: &str) -> Result<Option<String>> {
        let mut accepted = Vec::new();
        for stage in &mut self.stages {
            if let Some(params) = stage.generate_response(offer)? {
                accepted.push(params);
            }
        }
        if accepted.is_empty() {
            Ok(None)
        } else {
            Ok(Some(accepted.join(", ")))
        }
    }

    /// Hands the server's response header to each stage.
    pub(crate) fn activate(&mut self, response: &str) -> Result<()> {
        for stage in &mut self.stages {
            stage.activate(response)?;
        }
        Ok(())
    }

    pub(crate) fn process_outgoing_message(
        &mut self,
        opcode: OpCode,
        payload: Bytes,
    ) -> Result<(Bytes, bool)> {
        let mut payload = payload;
        let mut rsv1 = false;
        for stage in &mut self.stages {
            let (next, compressed) = stage.process_outgoing_message(opcode, payload)?;
            payload = next;
            rsv1 |= compressed;
        }
        Ok((payload, rsv1))
    }

    pub(crate) fn process_incoming_message(
        &mut self,
        payload: Bytes,
        compressed: bool,
    ) -> Result<Bytes> {
        let mut payload = payload;
        for stage in self.stages.iter_mut().rev() {
            payload = stage.process_incoming_message(payload, compressed)?;
        }
        Ok(payload)
    }

    pub(crate) fn process_outgoing_frame(&mut self, frame: Frame) -> Result<Frame> {
        let mut frame = frame;
        for stage in &mut self.stages {
            frame = stage.process_outgoing_frame(frame)?;
        }
        Ok(frame)
    }

    pub(crate) fn process_incoming_frame(&mut self, frame: Frame) -> Result<Frame> {
        let mut frame = frame;
        for stage in self.stages.iter_mut().rev() {
            frame = stage.process_incoming_frame(frame)?;
        }
        Ok(frame)
    }

    pub(crate) fn close(&mut self) {
        for stage in &mut self.stages {
            stage.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Appends its tag to outgoing payloads and strips it from incoming
    /// ones, so stage ordering is observable.
    struct Tagger {
        tag: u8,
    }

    impl Extension for Tagger {
        fn name(&self) -> &str {
            "tagger"
        }

        fn process_outgoing_message(
            &mut self,
            _opcode: OpCode,
            payload: Bytes,
        ) -> Result<(Bytes, bool)> {
            let mut out = payload.to_vec();
            out.push(self.tag);
            Ok((out.into(), false))
        }

        fn process_incoming_message(&mut self, payload: Bytes, _compressed: bool) -> Result<Bytes> {
            let mut out = payload.to_vec();
            assert_eq!(out.pop(), Some(self.tag));
            Ok(out.into())
        }
    }

    #[test]
    fn empty_pipeline_is_identity() {
        let mut pipeline = Pipeline::new();
        assert!(pipeline.is_empty());
        assert!(!pipeline.rsv1());
        assert_eq!(pipeline.generate_offer(), None);

        let (payload, rsv1) = pipeline
            .process_outgoing_message(OpCode::Binary, Bytes::from_static(b"abc"))
            .unwrap();
        assert_eq!(&payload[..], b"abc");
        assert!(!rsv1);
    }

    #[test]
    fn stages_run_in_order_and_reverse() {
        let mut pipeline = Pipeline::new();
        pipeline.push(Box::new(Tagger { tag: 1 }));
        pipeline.push(Box::new(Tagger { tag: 2 }));

        let (out, _) = pipeline
            .process_outgoing_message(OpCode::Binary, Bytes::from_static(b"x"))
            .unwrap();
        assert_eq!(&out[..], &[b'x', 1, 2]);

        // Incoming runs in reverse, so the same pipeline undoes its own
        // outgoing transform.
        let back = pipeline.process_incoming_message(out, false).unwrap();
        assert_eq!(&back[..], b"x");
    }

    #[test]
    fn frame_hooks_default_to_identity() {
        let mut pipeline = Pipeline::new();
        pipeline.push(Box::new(Tagger { tag: 7 }));

        let frame = Frame::text("untouched");
        let frame = pipeline.process_outgoing_frame(frame).unwrap();
        let frame = pipeline.process_incoming_frame(frame).unwrap();
        assert_eq!(&frame.payload[..], b"untouched");
    }
}
