//! Typed calls against one remote object.

use buslink_types::standard::{GET, GET_ALL, PROPERTIES, SET, SET_MULTI, SET_MULTI_INTERFACE};
use buslink_types::value::coerce_values;
use buslink_types::{
    Args, BusResult, BusType, Message, ObjectPath, Signature, SignatureSpec, Value, Variant,
};
use buslink_wire::Connection;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Destination, path and interface of a remote object, plus the connection
/// used to reach it. Cheap to clone.
#[derive(Clone)]
pub struct RemoteObject {
    conn: Arc<Connection>,
    destination: String,
    path: ObjectPath,
    interface: String,
    timeout: Option<Duration>,
}

impl RemoteObject {
    pub fn new(conn: Arc<Connection>, destination: &str, path: ObjectPath, interface: &str) -> Self {
        Self {
            conn,
            destination: destination.to_string(),
            path,
            interface: interface.to_string(),
            timeout: None,
        }
    }

    /// A copy whose calls wait at most `timeout` instead of the configured
    /// default: `remote.with_timeout(d).call(..)`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self.clone()
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Same destination and path, another interface.
    pub fn with_interface(&self, interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            ..self.clone()
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout.unwrap_or_else(|| self.conn.config().call_timeout())
    }

    fn message(&self, interface: &str, member: &str, body: Vec<Value>) -> Message {
        Message::method_call(
            Some(self.destination.as_str()),
            self.path.clone(),
            Some(interface),
            member,
            body,
        )
    }

    async fn send(&self, msg: Message) -> BusResult<Vec<Value>> {
        debug!(
            destination = %self.destination,
            path = %self.path,
            member = msg.member(),
            "Calling"
        );
        self.conn.call(msg, self.timeout()).await
    }

    /// Call `member` with typed arguments and decode a typed reply.
    pub async fn call<A: Args, R: Args>(&self, member: &str, args: A) -> BusResult<R> {
        A::signature().check_len()?;
        R::signature().check_len()?;
        let body = self
            .send(self.message(&self.interface, member, args.into_values()))
            .await?;
        R::from_values(coerce_values(body, &R::signature())?)
    }

    /// Call `member` with raw values. The reply is checked against
    /// `expected` unless it is [`SignatureSpec::Any`].
    pub async fn call_values(
        &self,
        member: &str,
        args: Vec<Value>,
        expected: &SignatureSpec,
    ) -> BusResult<Vec<Value>> {
        let body = self.send(self.message(&self.interface, member, args)).await?;
        match expected {
            SignatureSpec::Any => Ok(body),
            SignatureSpec::Exact(sig) => coerce_values(body, sig),
        }
    }

    /// Send a call that expects no reply.
    pub async fn notify(&self, member: &str, args: Vec<Value>) -> BusResult<()> {
        let msg = self.message(&self.interface, member, args).with_no_reply();
        self.send(msg).await.map(|_| ())
    }

    /// Live read of one property, unboxed.
    pub async fn get_value(&self, name: &str) -> BusResult<Value> {
        let body = self
            .send(self.message(PROPERTIES, GET, (self.interface.clone(), name.to_string()).into_values()))
            .await?;
        let (value,) = <(Value,)>::from_values(coerce_values(body, &Signature::variant())?)?;
        Ok(value.unboxed())
    }

    /// Live read of one property as `T`.
    pub async fn get<T: BusType>(&self, name: &str) -> BusResult<T> {
        let value = self.get_value(name).await?;
        T::from_value(value.coerce(&T::signature())?)
    }

    /// Live read of every readable property.
    pub async fn get_all(&self) -> BusResult<BTreeMap<String, Value>> {
        let body = self
            .send(self.message(PROPERTIES, GET_ALL, (self.interface.clone(),).into_values()))
            .await?;
        let (all,) = <(BTreeMap<String, Value>,)>::from_values(body)?;
        Ok(all)
    }

    pub async fn set(&self, name: &str, value: impl Into<Value>) -> BusResult<()> {
        let body = (self.interface.clone(), name.to_string(), Variant::new(value)).into_values();
        self.send(self.message(PROPERTIES, SET, body)).await.map(|_| ())
    }

    /// Write several properties in one step; either all are stored or none.
    pub async fn set_many(&self, values: BTreeMap<String, Value>) -> BusResult<()> {
        let body = (self.interface.clone(), values).into_values();
        self.send(self.message(SET_MULTI_INTERFACE, SET_MULTI, body))
            .await
            .map(|_| ())
    }
}

impl std::fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteObject")
            .field("destination", &self.destination)
            .field("path", &self.path)
            .field("interface", &self.interface)
            .field("timeout", &self.timeout)
            .finish()
    }
}
