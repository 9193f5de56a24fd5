//! 基于 btleplug 的无线层实现
//!
//! 使用平台默认 Manager 的第一个适配器。设备标识为 btleplug 的
//! `PeripheralId` 字符串；查找时也接受蓝牙地址。

use crate::ble::radio::{
    Advertisement, AdvertisementStream, CharProperties, CharacteristicHandle, Link,
    NotificationStream, Radio, WriteMode,
};
use crate::ble::{BleError, same_identity};
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::{StreamExt, future, stream};
use log::{debug, info};
use tokio::sync::Mutex;
use uuid::Uuid;

pub struct BtleplugRadio {
    adapter: Adapter,
    /// 活跃扫描的引用计数
    scan_refs: Mutex<usize>,
}

impl BtleplugRadio {
    pub async fn new() -> Result<Self, BleError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters.into_iter().next().ok_or(BleError::NoAdapter)?;

        match adapter.adapter_info().await {
            Ok(name) => info!("Using Bluetooth adapter: {}", name),
            Err(e) => debug!("Could not read adapter info: {}", e),
        }

        Ok(Self {
            adapter,
            scan_refs: Mutex::new(0),
        })
    }

    async fn find_peripheral(&self, identity: &str) -> Result<Peripheral, BleError> {
        for peripheral in self.adapter.peripherals().await? {
            if same_identity(&peripheral.id().to_string(), identity) {
                return Ok(peripheral);
            }
            if let Some(props) = peripheral.properties().await?
                && same_identity(&props.address.to_string(), identity)
            {
                return Ok(peripheral);
            }
        }

        Err(BleError::DeviceNotFound(identity.to_string()))
    }
}

async fn advertisement_of(peripheral: &Peripheral) -> Option<Advertisement> {
    let props = peripheral.properties().await.ok()??;
    Some(Advertisement {
        identity: peripheral.id().to_string(),
        local_name: props.local_name,
        services: props.services,
        rssi: props.rssi,
    })
}

#[async_trait::async_trait]
impl Radio for BtleplugRadio {
    async fn start_scan(&self) -> Result<AdvertisementStream, BleError> {
        let mut refs = self.scan_refs.lock().await;

        // 先订阅事件再开始扫描，避免漏掉首批广播
        let events = self.adapter.events().await?;
        if *refs == 0 {
            debug!("Starting adapter scan");
            self.adapter.start_scan(ScanFilter::default()).await?;
        }
        *refs += 1;
        drop(refs);

        // 扫描开始前已缓存的设备
        let mut cached = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            if let Some(adv) = advertisement_of(&peripheral).await {
                cached.push(adv);
            }
        }
        debug!("{} cached peripheral(s) known to adapter", cached.len());

        let adapter = self.adapter.clone();
        let live = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => return None,
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                advertisement_of(&peripheral).await
            }
        });

        Ok(stream::iter(cached).chain(live).boxed())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        let mut refs = self.scan_refs.lock().await;
        if *refs == 0 {
            return Ok(());
        }
        *refs -= 1;
        if *refs == 0 {
            debug!("Stopping adapter scan");
            self.adapter.stop_scan().await?;
        }
        Ok(())
    }

    async fn connect(&self, identity: &str) -> Result<Box<dyn Link>, BleError> {
        let peripheral = self.find_peripheral(identity).await?;

        info!("Connecting to {}", identity);
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }

        Ok(Box::new(BtleplugLink {
            identity: identity.to_string(),
            peripheral,
        }))
    }
}

struct BtleplugLink {
    identity: String,
    peripheral: Peripheral,
}

impl BtleplugLink {
    fn find(&self, service: Uuid, characteristic: Uuid) -> Option<Characteristic> {
        self.peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == service)
            .flat_map(|s| s.characteristics.into_iter())
            .find(|c| c.uuid == characteristic)
    }

    fn characteristic_for(&self, handle: &CharacteristicHandle) -> Result<Characteristic, BleError> {
        self.find(handle.service, handle.uuid)
            .ok_or(BleError::CharacteristicNotFound {
                service: handle.service,
                characteristic: handle.uuid,
            })
    }
}

fn to_handle(characteristic: &Characteristic) -> CharacteristicHandle {
    let flags = characteristic.properties;
    CharacteristicHandle {
        service: characteristic.service_uuid,
        uuid: characteristic.uuid,
        properties: CharProperties {
            read: flags.contains(CharPropFlags::READ),
            write: flags.contains(CharPropFlags::WRITE),
            write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
            notify: flags.contains(CharPropFlags::NOTIFY),
            indicate: flags.contains(CharPropFlags::INDICATE),
        },
    }
}

#[async_trait::async_trait]
impl Link for BtleplugLink {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn resolve(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Option<CharacteristicHandle>, BleError> {
        if let Some(found) = self.find(service, characteristic) {
            return Ok(Some(to_handle(&found)));
        }

        debug!("Discovering services on {}", self.identity);
        self.peripheral.discover_services().await?;
        Ok(self.find(service, characteristic).as_ref().map(to_handle))
    }

    async fn write(
        &self,
        characteristic: &CharacteristicHandle,
        chunk: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError> {
        let target = self.characteristic_for(characteristic)?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        self.peripheral.write(&target, chunk, write_type).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> Result<NotificationStream, BleError> {
        let target = self.characteristic_for(characteristic)?;

        let notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(&target).await?;

        let uuid = target.uuid;
        Ok(notifications
            .filter_map(move |n| future::ready((n.uuid == uuid).then_some(n.value)))
            .boxed())
    }

    async fn unsubscribe(&self, characteristic: &CharacteristicHandle) -> Result<(), BleError> {
        let target = self.characteristic_for(characteristic)?;
        self.peripheral.unsubscribe(&target).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}
