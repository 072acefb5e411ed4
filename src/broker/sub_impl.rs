// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! SUBSCRIBE/UNSUBSCRIBE handling: feature gates, filter validation,
//! trie and share-group bookkeeping, SUBACK/UNSUBACK reason codes, retained
//! message delivery per retain-handling, and cluster interest propagation.

use std::time::Instant;

use mio::Token;
use tracing::{debug, trace};

use crate::error::MqttError;
use crate::packet::property::Property;
use crate::packet::{
    Packet, Qos, RetainHandling, Suback, Subscribe, SubscriptionOptions, Unsuback, Unsubscribe,
};
use crate::reason_code::ReasonCode;
use crate::shared_subscription_manager::{parse_share, SharedSubscriptionDetails};
use crate::subscription_store::SubscriptionStore;

use super::{Broker, CloseIntent};

/// A retained-message replay owed to one freshly accepted filter.
struct RetainedJob {
    filter: String,
    granted_qos: Qos,
    sub_id: Option<u32>,
}

impl Broker {
    pub(super) fn handle_subscribe(
        &mut self,
        token: Token,
        subscribe: Subscribe,
        now: Instant,
    ) -> Option<CloseIntent> {
        let (client_id, username) = {
            let conn = self.connections.get(&token)?;
            (conn.client_id.clone()?, conn.username.clone())
        };

        let sub_id = subscribe.subscription_id();
        if sub_id.is_some() && !self.config.subscription_identifier_available {
            // Using a feature the broker advertised away is a protocol error.
            return Some(CloseIntent::error(&MqttError::Protocol(
                ReasonCode::SubscriptionIdentifiersNotSupported,
            )));
        }

        let mut reason_codes = Vec::with_capacity(subscribe.filters.len());
        let mut retained_jobs: Vec<RetainedJob> = Vec::new();
        let mut propagate: Vec<String> = Vec::new();

        for (filter, options) in &subscribe.filters {
            let code = if let Some((share_name, topic_filter)) = parse_share(filter) {
                if !self.config.shared_subscription_available {
                    ReasonCode::SharedSubscriptionsNotSupported
                } else if options.no_local {
                    // No-local on a shared subscription is a protocol error.
                    return Some(CloseIntent::error(&MqttError::protocol()));
                } else {
                    self.subscribe_shared(
                        &client_id,
                        username.as_deref(),
                        share_name,
                        topic_filter,
                        *options,
                        sub_id,
                        &mut propagate,
                    )
                }
            } else {
                self.subscribe_plain(
                    &client_id,
                    username.as_deref(),
                    filter,
                    *options,
                    sub_id,
                    &mut retained_jobs,
                    &mut propagate,
                )
            };
            reason_codes.push(code);
        }

        self.send_packet(
            token,
            &Packet::Suback(Suback {
                packet_id: subscribe.packet_id,
                properties: Vec::new(),
                reason_codes,
            }),
        );

        // Retained replay happens after the SUBACK is on the wire.
        for job in retained_jobs {
            self.deliver_retained(&client_id, &job, now);
        }
        for filter in propagate {
            self.propagate_subscription_added(&filter);
        }
        None
    }

    fn subscribe_plain(
        &mut self,
        client_id: &str,
        username: Option<&str>,
        filter: &str,
        options: SubscriptionOptions,
        sub_id: Option<u32>,
        retained_jobs: &mut Vec<RetainedJob>,
        propagate: &mut Vec<String>,
    ) -> ReasonCode {
        if SubscriptionStore::validate_topic_filter(filter).is_err() {
            return ReasonCode::TopicFilterInvalid;
        }
        let has_wildcard = filter
            .split('/')
            .any(|segment| segment == "+" || segment == "#");
        if has_wildcard && !self.config.wildcard_subscription_available {
            return ReasonCode::WildcardSubscriptionsNotSupported;
        }
        let authorized = match self.authenticator {
            Some(ref authenticator) => authenticator.allow_subscribe(username, filter),
            None => true,
        };
        if !authorized {
            debug!("subscribe to '{filter}' denied for client '{client_id}'");
            return ReasonCode::NotAuthorized;
        }

        let granted = SubscriptionOptions {
            qos: options.qos.min(self.config.maximum_qos),
            ..options
        };
        let is_new = match self
            .subscriptions
            .subscribe(client_id, filter, granted, sub_id)
        {
            Ok(is_new) => is_new,
            Err(_) => return ReasonCode::TopicFilterInvalid,
        };
        propagate.push(filter.to_string());

        let wants_retained = self.config.retain_available
            && match granted.retain_handling {
                RetainHandling::SendAlways => true,
                RetainHandling::SendIfNew => is_new,
                RetainHandling::DoNotSend => false,
            };
        if wants_retained {
            retained_jobs.push(RetainedJob {
                filter: filter.to_string(),
                granted_qos: granted.qos,
                sub_id,
            });
        }

        match granted.qos {
            Qos::AtMostOnce => ReasonCode::GRANTED_QOS_0,
            Qos::AtLeastOnce => ReasonCode::GrantedQos1,
            Qos::ExactlyOnce => ReasonCode::GrantedQos2,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn subscribe_shared(
        &mut self,
        client_id: &str,
        username: Option<&str>,
        share_name: &str,
        topic_filter: &str,
        options: SubscriptionOptions,
        sub_id: Option<u32>,
        propagate: &mut Vec<String>,
    ) -> ReasonCode {
        if SubscriptionStore::validate_topic_filter(topic_filter).is_err() {
            return ReasonCode::TopicFilterInvalid;
        }
        let has_wildcard = topic_filter
            .split('/')
            .any(|segment| segment == "+" || segment == "#");
        if has_wildcard && !self.config.wildcard_subscription_available {
            return ReasonCode::WildcardSubscriptionsNotSupported;
        }
        let authorized = match self.authenticator {
            Some(ref authenticator) => authenticator.allow_subscribe(username, topic_filter),
            None => true,
        };
        if !authorized {
            debug!(
                "shared subscribe to '{share_name}/{topic_filter}' denied for client '{client_id}'"
            );
            return ReasonCode::NotAuthorized;
        }

        let granted_qos = options.qos.min(self.config.maximum_qos);
        self.shared.insert(
            share_name,
            topic_filter,
            client_id,
            SharedSubscriptionDetails {
                options: SubscriptionOptions {
                    qos: granted_qos,
                    ..options
                },
                sub_id,
            },
        );
        // Peers need the inner filter to forward matching publishes here.
        propagate.push(topic_filter.to_string());
        trace!("client '{client_id}' joined share group '{share_name}' for '{topic_filter}'");

        // No retained replay for shared subscriptions.
        match granted_qos {
            Qos::AtMostOnce => ReasonCode::GRANTED_QOS_0,
            Qos::AtLeastOnce => ReasonCode::GrantedQos1,
            Qos::ExactlyOnce => ReasonCode::GrantedQos2,
        }
    }

    /// Deliver retained messages owed to a new subscription. Retained
    /// delivery always carries retain=1.
    fn deliver_retained(&mut self, client_id: &str, job: &RetainedJob, now: Instant) {
        let messages: Vec<(String, Qos, Vec<Property>, bytes::Bytes)> = self
            .retained
            .get_matching(&job.filter, now)
            .into_iter()
            .map(|m| {
                (
                    m.topic_name.clone(),
                    m.qos,
                    m.properties.clone(),
                    m.payload.clone(),
                )
            })
            .collect();
        for (topic, qos, mut properties, payload) in messages {
            if let Some(sub_id) = job.sub_id {
                properties.push(Property::SubscriptionIdentifier(sub_id));
            }
            self.deliver_publish(
                client_id,
                &topic,
                qos.min(job.granted_qos),
                true,
                properties,
                payload,
                now,
            );
        }
    }

    pub(super) fn handle_unsubscribe(
        &mut self,
        token: Token,
        unsubscribe: Unsubscribe,
        _now: Instant,
    ) -> Option<CloseIntent> {
        let client_id = self.connections.get(&token)?.client_id.clone()?;

        let mut reason_codes = Vec::with_capacity(unsubscribe.filters.len());
        let mut removed_filters: Vec<String> = Vec::new();

        for filter in &unsubscribe.filters {
            let code = if let Some((share_name, topic_filter)) = parse_share(filter) {
                if self.shared.remove(share_name, topic_filter, &client_id) {
                    removed_filters.push(topic_filter.to_string());
                    ReasonCode::Success
                } else {
                    ReasonCode::NoSubscriptionExisted
                }
            } else {
                match self.subscriptions.unsubscribe(&client_id, filter) {
                    Ok(true) => {
                        removed_filters.push(filter.clone());
                        ReasonCode::Success
                    }
                    Ok(false) => ReasonCode::NoSubscriptionExisted,
                    Err(_) => ReasonCode::TopicFilterInvalid,
                }
            };
            reason_codes.push(code);
        }

        self.send_packet(
            token,
            &Packet::Unsuback(Unsuback {
                packet_id: unsubscribe.packet_id,
                properties: Vec::new(),
                reason_codes,
            }),
        );

        self.drop_subscription_interest(&removed_filters);
        None
    }
}
