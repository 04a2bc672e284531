//! The radio station and the servers of the main host.

use courier_core::{ContractRegistry, HostContext, Hub, RemoteError};
use courier_server::{HandlerResult, MethodTable, Server, ServerError, serve};
use futures_util::future::{self, BoxFuture, Ready};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

const LOWER_BOUND: f64 = 87.5;
const UPPER_BOUND: f64 = 108.0;
const SEEK_STEP: f64 = 0.1;

/// Tuner, bookmarks and listening history.
#[derive(Debug)]
pub struct Station {
    frequency: f64,
    // Tenths of MHz, so they order and compare exactly.
    favorites: BTreeSet<u32>,
    history: Vec<f64>,
}

pub type SharedStation = Arc<Mutex<Station>>;

pub fn shared() -> SharedStation {
    Arc::new(Mutex::new(Station {
        frequency: LOWER_BOUND,
        favorites: BTreeSet::new(),
        history: Vec::new(),
    }))
}

fn tenths(frequency: f64) -> u32 {
    (frequency * 10.0).round() as u32
}

fn from_tenths(tenths: u32) -> f64 {
    f64::from(tenths) / 10.0
}

impl Station {
    fn tune(&mut self, frequency: f64) -> Result<f64, RemoteError> {
        if !(LOWER_BOUND..=UPPER_BOUND).contains(&frequency) {
            return Err(RemoteError::handler(format!(
                "{frequency} MHz is outside the FM band"
            )));
        }
        self.frequency = from_tenths(tenths(frequency));
        Ok(self.frequency)
    }

    fn seek(&mut self, step: f64) -> f64 {
        let mut next = self.frequency + step;
        if next > UPPER_BOUND {
            next = LOWER_BOUND;
        } else if next < LOWER_BOUND {
            next = UPPER_BOUND;
        }
        self.frequency = from_tenths(tenths(next));
        self.frequency
    }

    fn contains(&self, frequency: f64) -> bool {
        self.favorites.contains(&tenths(frequency))
    }

    fn add(&mut self, frequency: f64) -> bool {
        self.favorites.insert(tenths(frequency))
    }

    fn remove(&mut self, frequency: f64) -> bool {
        self.favorites.remove(&tenths(frequency))
    }

    fn favorites(&self) -> Vec<f64> {
        self.favorites.iter().copied().map(from_tenths).collect()
    }
}

fn number(args: &[Value]) -> f64 {
    args.first().and_then(Value::as_f64).unwrap_or_default()
}

/// A synchronous handler over the locked station.
fn on<F>(
    station: &SharedStation,
    f: F,
) -> impl Fn(Vec<Value>) -> Ready<HandlerResult> + Send + Sync + use<F>
where
    F: Fn(&mut Station, &[Value]) -> HandlerResult + Send + Sync + 'static,
{
    let station = station.clone();
    move |args| {
        let mut station = station.lock().unwrap_or_else(PoisonError::into_inner);
        future::ready(f(&mut station, &args))
    }
}

/// Dialer logic. Bookmark changes are reported on `changed`.
fn logic(station: &SharedStation, changed: mpsc::UnboundedSender<Vec<f64>>) -> MethodTable {
    let toggled = changed.clone();
    let added = changed.clone();
    MethodTable::new()
        .method("getFrequency", on(station, |s, _| Ok(json!(s.frequency))))
        .method("setFrequency", on(station, |s, args| Ok(json!(s.tune(number(args))?))))
        .method("seekUp", on(station, |s, _| Ok(json!(s.seek(SEEK_STEP)))))
        .method("seekDown", on(station, |s, _| Ok(json!(s.seek(-SEEK_STEP)))))
        .method(
            "toggleBookmark",
            on(station, move |s, _| {
                let frequency = s.frequency;
                let bookmarked = if s.contains(frequency) {
                    !s.remove(frequency)
                } else {
                    s.add(frequency)
                };
                let _ = toggled.send(s.favorites());
                Ok(json!(bookmarked))
            }),
        )
        .method(
            "addBookmark",
            on(station, move |s, args| {
                let added_now = s.add(number(args));
                let _ = added.send(s.favorites());
                Ok(json!(added_now))
            }),
        )
        .method(
            "removeBookmark",
            on(station, move |s, args| {
                let removed = s.remove(number(args));
                let _ = changed.send(s.favorites());
                Ok(json!(removed))
            }),
        )
}

fn history(station: &SharedStation) -> MethodTable {
    MethodTable::new()
        .method(
            "save",
            on(station, |s, args| {
                s.history.push(number(args));
                Ok(json!(true))
            }),
        )
        .method("restore", on(station, |s, _| Ok(json!(s.history.last()))))
}

fn favorites(station: &SharedStation) -> MethodTable {
    MethodTable::new()
        .method("getAll", on(station, |s, _| Ok(json!(s.favorites()))))
        .method("contains", on(station, |s, args| Ok(json!(s.contains(number(args))))))
        .method("add", on(station, |s, args| Ok(json!(s.add(number(args))))))
        .method("remove", on(station, |s, args| Ok(json!(s.remove(number(args))))))
}

fn servers(hub: &Hub, registry: &ContractRegistry, station: &SharedStation) -> Result<Vec<Server>, ServerError> {
    let (changed, mut changes) = mpsc::unbounded_channel();
    let logic = Server::new(hub.clone(), registry, "logic", "1.0", logic(station, changed))?;
    let history = Server::new(hub.clone(), registry, "history", "1.0", history(station))?;
    let favorites = Server::new(hub.clone(), registry, "favorites", "1.0", favorites(station))?;

    // Ends once the logic server, the only sender, is dropped.
    let notifier = favorites.clone();
    tokio::spawn(async move {
        while let Some(list) = changes.recv().await {
            if let Err(e) = notifier.broadcast("changed", &list) {
                tracing::warn!("failed to broadcast favorites: {}", e);
            }
        }
    });

    Ok(vec![logic, history, favorites])
}

/// Body of the `servers/main` host.
pub fn host(
    registry: Arc<ContractRegistry>,
    station: SharedStation,
) -> impl Fn(HostContext) -> BoxFuture<'static, ()> + Send + Sync + 'static {
    move |ctx: HostContext| {
        let (registry, station) = (registry.clone(), station.clone());
        let body: BoxFuture<'static, ()> = Box::pin(async move {
            match servers(&ctx.hub, &registry, &station) {
                Ok(servers) => serve(ctx, servers).await,
                Err(e) => tracing::error!(location = %ctx.location, "failed to start servers: {}", e),
            }
        });
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_stays_in_band() {
        let station = shared();
        let mut s = station.lock().unwrap();
        assert_eq!(s.tune(91.13).unwrap(), 91.1);
        assert!(s.tune(120.0).is_err());
        assert_eq!(s.frequency, 91.1);

        s.tune(UPPER_BOUND).unwrap();
        assert_eq!(s.seek(SEEK_STEP), LOWER_BOUND);
        assert_eq!(s.seek(-SEEK_STEP), UPPER_BOUND);
    }

    #[test]
    fn favorites_are_kept_sorted() {
        let station = shared();
        let mut s = station.lock().unwrap();
        assert!(s.add(98.5));
        assert!(s.add(91.1));
        assert!(!s.add(91.1));
        assert_eq!(s.favorites(), vec![91.1, 98.5]);
        assert!(s.remove(98.5));
        assert!(!s.contains(98.5));
    }
}
