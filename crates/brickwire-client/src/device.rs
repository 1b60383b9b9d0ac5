//! Generic device facade.
//!
//! A [`Device`] binds a UID to a connection and turns typed arguments into
//! requests using caller-supplied [`Format`]s. Device-specific bindings sit
//! on top of it and only provide function IDs and formats.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use brickwire_protocol::{Format, Identity, Uid, Value, function};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::connection::IpConnection;
use crate::correlator::Request;
use crate::dispatcher::{CallbackEvent, CallbackKey};
use crate::error::{ClientError, ClientResult};
use crate::stream::{Chunk, StreamReader, StreamWriter};

/// Whether a function answers with a response packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseExpected {
    /// Getters; cannot be changed.
    AlwaysTrue,
    /// Setter that currently asks for a response.
    True,
    /// Setter that currently does not.
    False,
}

impl ResponseExpected {
    pub fn is_expected(self) -> bool {
        !matches!(self, Self::False)
    }
}

/// One device reachable through an [`IpConnection`].
pub struct Device {
    uid: u32,
    connection: IpConnection,
    response_expected: Mutex<HashMap<u8, ResponseExpected>>,
    stream_lock: AsyncMutex<()>,
}

impl Device {
    /// Creates a facade for the device with `uid`.
    pub fn new(uid: impl Into<u32>, connection: &IpConnection) -> Self {
        let device = Self {
            uid: uid.into(),
            connection: connection.clone(),
            response_expected: Mutex::new(HashMap::new()),
            stream_lock: AsyncMutex::new(()),
        };
        device.declare(function::GET_IDENTITY, ResponseExpected::AlwaysTrue);
        device
    }

    pub fn uid(&self) -> Uid {
        Uid::new(self.uid)
    }

    pub fn connection(&self) -> &IpConnection {
        &self.connection
    }

    /// Declares the response behaviour of a function.
    pub fn declare(&self, function_id: u8, response_expected: ResponseExpected) {
        self.table().insert(function_id, response_expected);
    }

    /// Returns whether `function_id` currently expects a response.
    ///
    /// Undeclared functions are treated as getters.
    pub fn response_expected(&self, function_id: u8) -> bool {
        self.table()
            .get(&function_id)
            .is_none_or(|flag| flag.is_expected())
    }

    /// Changes the response flag of a declared setter.
    pub fn set_response_expected(&self, function_id: u8, expected: bool) -> ClientResult<()> {
        let mut table = self.table();
        match table.get_mut(&function_id) {
            None => Err(ClientError::invalid_argument(format!(
                "function {function_id} is not declared"
            ))),
            Some(ResponseExpected::AlwaysTrue) => Err(ClientError::invalid_argument(format!(
                "response expected flag of function {function_id} cannot be changed"
            ))),
            Some(flag) => {
                *flag = if expected {
                    ResponseExpected::True
                } else {
                    ResponseExpected::False
                };
                Ok(())
            }
        }
    }

    /// Changes the response flag of every declared setter.
    pub fn set_response_expected_all(&self, expected: bool) {
        for flag in self.table().values_mut() {
            if *flag != ResponseExpected::AlwaysTrue {
                *flag = if expected {
                    ResponseExpected::True
                } else {
                    ResponseExpected::False
                };
            }
        }
    }

    /// Packs `args` with `request_format`, sends them and unpacks the
    /// response with `response_format`.
    ///
    /// Returns no values when the function does not expect a response.
    pub async fn send_request(
        &self,
        function_id: u8,
        args: &[Value],
        request_format: &Format,
        response_format: &Format,
    ) -> ClientResult<Vec<Value>> {
        let payload = request_format.pack(args)?;
        let expected = self.response_expected(function_id);

        let mut request = Request::new(self.uid, function_id)
            .with_payload(payload)
            .with_response_expected(expected);
        if expected {
            request = request.expect_response_length(response_format.size());
        }

        let response = self.connection.call(request).await?;
        if !expected {
            return Ok(Vec::new());
        }

        debug!(
            uid = %self.uid(),
            function_id,
            length = response.len(),
            "response received"
        );
        Ok(response_format.unpack(&response)?)
    }

    /// Asks the device who it is.
    pub async fn get_identity(&self) -> ClientResult<Identity> {
        let format = Identity::format();
        let request = Request::new(self.uid, function::GET_IDENTITY)
            .expect_response_length(format.size());
        let response = self.connection.call(request).await?;
        Ok(Identity::from_payload(&response)?)
    }

    /// Reads a chunked value. Streams of one device never interleave.
    pub async fn read_stream<T, F, Fut>(&self, reader: &StreamReader, fetch: F) -> ClientResult<Vec<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<Chunk<T>>>,
    {
        let _stream = self.stream_lock.lock().await;
        reader.read(fetch).await
    }

    /// Writes a chunked value. Streams of one device never interleave.
    pub async fn write_stream<T, R, F, Fut>(
        &self,
        writer: &StreamWriter,
        data: &[T],
        padding: T,
        send: F,
    ) -> ClientResult<R>
    where
        T: Clone,
        F: FnMut(Chunk<T>) -> Fut,
        Fut: Future<Output = ClientResult<R>>,
    {
        let _stream = self.stream_lock.lock().await;
        writer.write(data, padding, send).await
    }

    /// Registers a handler for a callback of this device.
    pub fn register_callback<F>(&self, function_id: u8, handler: F)
    where
        F: Fn(&CallbackEvent) + Send + Sync + 'static,
    {
        self.connection
            .register_callback(CallbackKey::device(self.uid, function_id), handler);
    }

    /// Removes the handler for a callback of this device.
    pub fn unregister_callback(&self, function_id: u8) -> bool {
        self.connection
            .unregister_callback(CallbackKey::device(self.uid, function_id))
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<u8, ResponseExpected>> {
        self.response_expected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        let connection = IpConnection::new().unwrap();
        let device = Device::new(42u32, &connection);
        device.declare(1, ResponseExpected::True);
        device.declare(2, ResponseExpected::False);
        device.declare(3, ResponseExpected::AlwaysTrue);
        device
    }

    #[test]
    fn undeclared_functions_expect_a_response() {
        let device = device();
        assert!(device.response_expected(99));
        assert!(device.response_expected(function::GET_IDENTITY));
        assert!(!device.response_expected(2));
    }

    #[test]
    fn setters_can_be_toggled() {
        let device = device();
        device.set_response_expected(1, false).unwrap();
        device.set_response_expected(2, true).unwrap();
        assert!(!device.response_expected(1));
        assert!(device.response_expected(2));
    }

    #[test]
    fn getters_and_unknown_functions_reject_changes() {
        let device = device();
        assert!(matches!(
            device.set_response_expected(3, false),
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(matches!(
            device.set_response_expected(77, false),
            Err(ClientError::InvalidArgument(_))
        ));
    }

    #[test]
    fn set_all_leaves_getters_alone() {
        let device = device();
        device.set_response_expected_all(false);
        assert!(!device.response_expected(1));
        assert!(!device.response_expected(2));
        assert!(device.response_expected(3));
        assert!(device.response_expected(function::GET_IDENTITY));
    }

    #[tokio::test]
    async fn request_without_connection_fails() {
        let device = device();
        let format = Format::parse("I").unwrap();
        let result = device
            .send_request(1, &[Value::U32(1)], &format, &Format::empty())
            .await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn bad_arguments_fail_before_sending() {
        let device = device();
        let format = Format::parse("I").unwrap();
        let result = device
            .send_request(1, &[Value::Str("x".into())], &format, &Format::empty())
            .await;
        assert!(matches!(result, Err(ClientError::Protocol(_))));
    }
}
