//! Handler registration and per-moment dispatch

use std::any::Any;
use std::collections::HashMap;

use crate::error::Result;
use crate::model::{EventRecord, Moment, MomentInfo};
use crate::payload::{EventPayload, PayloadRegistry};

type MomentHandler = Box<dyn FnMut(&MomentInfo) + Send>;
type RawEventHandler = Box<dyn FnMut(&MomentInfo, &EventRecord) + Send>;
type TypedEventHandler = Box<dyn FnMut(&MomentInfo, &(dyn Any + Send)) + Send>;

/// Registered callbacks of one reader
#[derive(Default)]
pub(crate) struct Handlers {
    registry: PayloadRegistry,
    moment: Vec<MomentHandler>,
    raw: Vec<RawEventHandler>,
    typed: HashMap<&'static str, Vec<TypedEventHandler>>,
}

impl Handlers {
    pub(crate) fn add_moment_handler(&mut self, handler: impl FnMut(&MomentInfo) + Send + 'static) {
        self.moment.push(Box::new(handler));
    }

    pub(crate) fn add_raw_event_handler(
        &mut self,
        handler: impl FnMut(&MomentInfo, &EventRecord) + Send + 'static,
    ) {
        self.raw.push(Box::new(handler));
    }

    pub(crate) fn add_event_handler<T: EventPayload>(
        &mut self,
        mut handler: impl FnMut(&MomentInfo, &T) + Send + 'static,
    ) -> Result<()> {
        self.registry.register::<T>()?;
        self.typed
            .entry(T::TYPE_TAG)
            .or_default()
            .push(Box::new(move |info: &MomentInfo, payload: &(dyn Any + Send)| {
                match payload.downcast_ref::<T>() {
                    Some(value) => handler(info, value),
                    None => tracing::warn!(
                        index = info.index,
                        type_tag = T::TYPE_TAG,
                        expected = std::any::type_name::<T>(),
                        "Decoded payload has an unexpected type"
                    ),
                }
            }));
        Ok(())
    }

    /// Moment handlers first, then each event in order: raw handlers, then
    /// typed handlers in registration order. An event is decoded once.
    pub(crate) fn dispatch(&mut self, moment: &Moment) {
        let info = moment.info();
        for handler in &mut self.moment {
            handler(&info);
        }

        for event in &moment.events {
            for handler in &mut self.raw {
                handler(&info, event);
            }

            let Some(handlers) = self.typed.get_mut(event.type_tag.as_str()) else {
                continue;
            };
            match self.registry.decode(&event.type_tag, &event.payload) {
                Ok(decoded) => {
                    for handler in handlers.iter_mut() {
                        handler(&info, decoded.as_ref());
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        index = info.index,
                        utc = %info.utc,
                        type_tag = %event.type_tag,
                        error = %e,
                        "Skipping undecodable event"
                    );
                }
            }
        }
    }
}
