//! Scripted replies to every LDAP operation.
//!
//! Each handler builds a transcript of what the client asked, writes a fixed
//! reply that never depends on the request being valid, and only then hands
//! the transcript to the recorder. The reply must reach the client even when
//! storage is down.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ldap3_proto::proto::{
    LdapAddRequest, LdapBindCred, LdapBindRequest, LdapBindResponse, LdapCompareRequest,
    LdapExtendedRequest, LdapExtendedResponse, LdapFilter, LdapModifyRequest, LdapModifyType,
    LdapMsg, LdapOp, LdapPartialAttribute, LdapResult, LdapResultCode, LdapSearchRequest,
    LdapSearchResultEntry,
};
use tracing::instrument;

use crate::constants::{
    DIAG_DEFAULT_BIND, DIAG_NOT_IMPLEMENTED, OID_STARTTLS, OID_WHOAMI, SYNTHETIC_ENTRY_ATTRS,
    SYNTHETIC_ENTRY_CN,
};
use crate::correlation::CorrelationMatcher;
use crate::error::{SessionError, TlsError};
use crate::recorder::InteractionRecorder;

/// The connection side of a request, as seen by a handler.
#[async_trait]
pub trait LdapClient: Send {
    fn remote_address(&self) -> SocketAddr;

    async fn write(&mut self, msg: LdapMsg) -> Result<(), SessionError>;

    /// Upgrade the transport in place. On error the plaintext transport is
    /// still in use.
    async fn start_tls(&mut self) -> Result<(), TlsError>;

    /// Flag the in-flight request `msgid`. False if no such request exists.
    fn abandon(&self, msgid: i32) -> bool;

    /// Whether `msgid` was flagged by an Abandon while it was in flight.
    ///
    /// The flag is cooperative. A connection that handles its requests one
    /// at a time has finished `msgid` before it reads the Abandon, so this
    /// only turns true for clients that dispatch requests concurrently.
    fn is_abandoned(&self, msgid: i32) -> bool;
}

/// What the connection should do after a request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

pub struct LdapResponder {
    recorder: Arc<InteractionRecorder>,
    matcher: CorrelationMatcher,
}

fn ldap_result(code: LdapResultCode, message: &str) -> LdapResult {
    LdapResult {
        code,
        matcheddn: String::new(),
        message: message.to_string(),
        referral: Vec::new(),
    }
}

fn success() -> LdapResult {
    ldap_result(LdapResultCode::Success, "")
}

fn extended_response(msgid: i32, res: LdapResult, name: Option<String>) -> LdapMsg {
    LdapMsg {
        msgid,
        op: LdapOp::ExtendedResponse(LdapExtendedResponse {
            res,
            name,
            value: None,
        }),
        ctrl: vec![],
    }
}

fn values_to_string(vals: &[Vec<u8>]) -> Vec<String> {
    vals.iter()
        .map(|v| String::from_utf8_lossy(v).into_owned())
        .collect()
}

fn escape_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\\' => escaped.push_str("\\5c"),
            '\0' => escaped.push_str("\\00"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Render a filter in its RFC 4515 string form.
pub fn filter_to_string(filter: &LdapFilter) -> String {
    match filter {
        LdapFilter::And(inner) => format!(
            "(&{})",
            inner.iter().map(filter_to_string).collect::<String>()
        ),
        LdapFilter::Or(inner) => format!(
            "(|{})",
            inner.iter().map(filter_to_string).collect::<String>()
        ),
        LdapFilter::Not(inner) => format!("(!{})", filter_to_string(inner)),
        LdapFilter::Equality(a, v) => format!("({}={})", a, escape_filter_value(v)),
        LdapFilter::Present(a) => format!("({a}=*)"),
        LdapFilter::Substring(a, sub) => {
            let mut s = format!("({a}=");
            if let Some(initial) = &sub.initial {
                s.push_str(&escape_filter_value(initial));
            }
            s.push('*');
            for any in &sub.any {
                s.push_str(&escape_filter_value(any));
                s.push('*');
            }
            if let Some(final_) = &sub.final_ {
                s.push_str(&escape_filter_value(final_));
            }
            s.push(')');
            s
        }
        // Approximate, ordering and extensible matches are rare in probes.
        other => format!("({other:?})"),
    }
}

/// The name of an operation as it appears in a transcript.
pub fn op_name(op: &LdapOp) -> &'static str {
    match op {
        LdapOp::BindRequest(_) => "Bind",
        LdapOp::BindResponse(_) => "BindResponse",
        LdapOp::UnbindRequest => "Unbind",
        LdapOp::SearchRequest(_) => "Search",
        LdapOp::SearchResultEntry(_) => "SearchResultEntry",
        LdapOp::SearchResultDone(_) => "SearchResultDone",
        LdapOp::ModifyRequest(_) => "Modify",
        LdapOp::ModifyResponse(_) => "ModifyResponse",
        LdapOp::AddRequest(_) => "Add",
        LdapOp::AddResponse(_) => "AddResponse",
        LdapOp::DelRequest(_) => "Delete",
        LdapOp::DelResponse(_) => "DeleteResponse",
        LdapOp::ModifyDNRequest(_) => "ModifyDN",
        LdapOp::ModifyDNResponse(_) => "ModifyDNResponse",
        LdapOp::CompareRequest(_) => "Compare",
        LdapOp::CompareResult(_) => "CompareResponse",
        LdapOp::AbandonRequest(_) => "Abandon",
        LdapOp::ExtendedRequest(_) => "Extended",
        LdapOp::ExtendedResponse(_) => "ExtendedResponse",
        _ => "Unknown",
    }
}

impl LdapResponder {
    pub fn new(recorder: Arc<InteractionRecorder>, matcher: CorrelationMatcher) -> Self {
        LdapResponder { recorder, matcher }
    }

    #[instrument(level = "debug", name = "ldap-request", skip_all, fields(msgid = msg.msgid, op = op_name(&msg.op)))]
    pub async fn handle<C>(&self, client: &mut C, msg: LdapMsg) -> Result<Flow, SessionError>
    where
        C: LdapClient + ?Sized,
    {
        let remote = client.remote_address().to_string();
        let LdapMsg { msgid, op, ctrl: _ } = msg;

        security_info!(
            client_ip = %client.remote_address().ip(),
            client_port = %client.remote_address().port(),
            "LDAP client"
        );

        match op {
            LdapOp::BindRequest(LdapBindRequest {
                dn,
                cred: LdapBindCred::Simple(pw),
            }) => self.bind(client, msgid, &dn, &pw, &remote).await,
            LdapOp::SearchRequest(sr) => self.search(client, msgid, sr, &remote).await,
            LdapOp::AbandonRequest(target) => self.abandon(client, target, &remote).await,
            LdapOp::CompareRequest(cr) => self.compare(client, msgid, cr, &remote).await,
            LdapOp::AddRequest(ar) => self.add(client, msgid, ar, &remote).await,
            LdapOp::DelRequest(dn) => self.delete(client, msgid, &dn, &remote).await,
            LdapOp::ModifyRequest(mr) => self.modify(client, msgid, mr, &remote).await,
            LdapOp::ExtendedRequest(er) => self.extended(client, msgid, er, &remote).await,
            LdapOp::UnbindRequest => {
                request_info!("LDAP client requested unbind");
                Ok(Flow::Close)
            }
            other => self.not_found(client, msgid, other, &remote).await,
        }
    }

    async fn bind<C>(
        &self,
        client: &mut C,
        msgid: i32,
        dn: &str,
        pw: &str,
        remote: &str,
    ) -> Result<Flow, SessionError>
    where
        C: LdapClient + ?Sized,
    {
        let transcript =
            format!("Type=Bind\nAuthenticationChoice=simple\nUser={dn}\nPass={pw}\n");

        client
            .write(LdapMsg {
                msgid,
                op: LdapOp::BindResponse(LdapBindResponse {
                    res: success(),
                    saslcreds: None,
                }),
                ctrl: vec![],
            })
            .await?;

        self.recorder.record_unidentified(&transcript, remote).await;
        Ok(Flow::Continue)
    }

    async fn search<C>(
        &self,
        client: &mut C,
        msgid: i32,
        sr: LdapSearchRequest,
        remote: &str,
    ) -> Result<Flow, SessionError>
    where
        C: LdapClient + ?Sized,
    {
        let attrs = sr.attrs.join(" ");
        let transcript = format!(
            "Type=Search\nBaseDn={}\nFilter={:?}\nFilterString={}\nAttributes=[{}]\nTimeLimit={}\n",
            sr.base,
            sr.filter,
            filter_to_string(&sr.filter),
            attrs,
            sr.timelimit
        );

        // The time limit is recorded, never enforced.
        if client.is_abandoned(msgid) {
            request_info!(msgid, "Search abandoned, skipping entry");
        } else {
            let dn = if sr.base.is_empty() {
                format!("cn={SYNTHETIC_ENTRY_CN}")
            } else {
                format!("cn={}, {}", SYNTHETIC_ENTRY_CN, sr.base)
            };
            let attributes = SYNTHETIC_ENTRY_ATTRS
                .iter()
                .map(|(atype, vals)| LdapPartialAttribute {
                    atype: atype.to_string(),
                    vals: vals.iter().map(|v| v.as_bytes().to_vec()).collect(),
                })
                .collect();
            client
                .write(LdapMsg {
                    msgid,
                    op: LdapOp::SearchResultEntry(LdapSearchResultEntry { dn, attributes }),
                    ctrl: vec![],
                })
                .await?;
        }

        client
            .write(LdapMsg {
                msgid,
                op: LdapOp::SearchResultDone(success()),
                ctrl: vec![],
            })
            .await?;

        if let Some(cid) = self.matcher.extract(&sr.base) {
            request_info!(unique_id = %cid.unique_id, "Correlation identifier found in base DN");
            self.recorder
                .record_identified(&cid, &transcript, remote)
                .await;
        }
        self.recorder.record_unidentified(&transcript, remote).await;
        Ok(Flow::Continue)
    }

    async fn abandon<C>(&self, client: &mut C, target: i32, remote: &str) -> Result<Flow, SessionError>
    where
        C: LdapClient + ?Sized,
    {
        if client.abandon(target) {
            request_info!(target, "Abandoned in-flight request");
        } else {
            request_trace!(target, "Abandon for unknown request");
        }
        let transcript = format!("Type=Abandon\nMessageID={target}\n");
        self.recorder.record_unidentified(&transcript, remote).await;
        Ok(Flow::Continue)
    }

    async fn compare<C>(
        &self,
        client: &mut C,
        msgid: i32,
        cr: LdapCompareRequest,
        remote: &str,
    ) -> Result<Flow, SessionError>
    where
        C: LdapClient + ?Sized,
    {
        let transcript = format!(
            "Type=Compare\nEntity={}\nAttribute name to compare={}\nAttribute value expected={}\n",
            cr.dn,
            cr.atype,
            String::from_utf8_lossy(&cr.val)
        );

        client
            .write(LdapMsg {
                msgid,
                op: LdapOp::CompareResult(ldap_result(LdapResultCode::CompareTrue, "")),
                ctrl: vec![],
            })
            .await?;

        self.recorder.record_unidentified(&transcript, remote).await;
        Ok(Flow::Continue)
    }

    async fn add<C>(
        &self,
        client: &mut C,
        msgid: i32,
        ar: LdapAddRequest,
        remote: &str,
    ) -> Result<Flow, SessionError>
    where
        C: LdapClient + ?Sized,
    {
        let mut transcript = format!("Type=Add\nEntity={}\n", ar.dn);
        for attr in &ar.attributes {
            for val in values_to_string(&attr.vals) {
                let _ = writeln!(
                    transcript,
                    "Attribute Name={} Attribute Value={}",
                    attr.atype, val
                );
            }
        }

        client
            .write(LdapMsg {
                msgid,
                op: LdapOp::AddResponse(success()),
                ctrl: vec![],
            })
            .await?;

        self.recorder.record_unidentified(&transcript, remote).await;
        Ok(Flow::Continue)
    }

    async fn delete<C>(
        &self,
        client: &mut C,
        msgid: i32,
        dn: &str,
        remote: &str,
    ) -> Result<Flow, SessionError>
    where
        C: LdapClient + ?Sized,
    {
        let transcript = format!("Type=Delete\nEntity={dn}\n");

        client
            .write(LdapMsg {
                msgid,
                op: LdapOp::DelResponse(success()),
                ctrl: vec![],
            })
            .await?;

        self.recorder.record_unidentified(&transcript, remote).await;
        Ok(Flow::Continue)
    }

    async fn modify<C>(
        &self,
        client: &mut C,
        msgid: i32,
        mr: LdapModifyRequest,
        remote: &str,
    ) -> Result<Flow, SessionError>
    where
        C: LdapClient + ?Sized,
    {
        let mut transcript = format!("Type=Modify\nEntity={}\n", mr.dn);
        for change in &mr.changes {
            let operation = match change.operation {
                LdapModifyType::Add => "Add",
                LdapModifyType::Delete => "Delete",
                LdapModifyType::Replace => "Replace",
            };
            let _ = writeln!(
                transcript,
                "Operation={} Attribute={} Values=[{}]",
                operation,
                change.modification.atype,
                values_to_string(&change.modification.vals).join(" - ")
            );
        }

        client
            .write(LdapMsg {
                msgid,
                op: LdapOp::ModifyResponse(success()),
                ctrl: vec![],
            })
            .await?;

        self.recorder.record_unidentified(&transcript, remote).await;
        Ok(Flow::Continue)
    }

    async fn extended<C>(
        &self,
        client: &mut C,
        msgid: i32,
        er: LdapExtendedRequest,
        remote: &str,
    ) -> Result<Flow, SessionError>
    where
        C: LdapClient + ?Sized,
    {
        match er.name.as_str() {
            OID_STARTTLS => self.start_tls(client, msgid, remote).await,
            OID_WHOAMI => {
                client
                    .write(extended_response(msgid, success(), None))
                    .await?;
                self.recorder
                    .record_unidentified("Type=WhoAmI\n", remote)
                    .await;
                Ok(Flow::Continue)
            }
            name => {
                let value = er
                    .value
                    .as_deref()
                    .map(String::from_utf8_lossy)
                    .unwrap_or_default();
                let transcript = format!("Type=Extended\nName={name}\nValue={value}\n");

                client
                    .write(extended_response(msgid, success(), None))
                    .await?;

                self.recorder.record_unidentified(&transcript, remote).await;
                Ok(Flow::Continue)
            }
        }
    }

    async fn start_tls<C>(&self, client: &mut C, msgid: i32, remote: &str) -> Result<Flow, SessionError>
    where
        C: LdapClient + ?Sized,
    {
        client
            .write(extended_response(
                msgid,
                success(),
                Some(OID_STARTTLS.to_string()),
            ))
            .await?;

        let transcript = match client.start_tls().await {
            Ok(()) => {
                security_info!(%remote, "StartTLS complete");
                "Type=StartTLS\nResult=StartTLS OK\n".to_string()
            }
            Err(e) => {
                security_error!(%remote, err = %e, "StartTLS handshake failed");
                client
                    .write(extended_response(
                        msgid,
                        ldap_result(
                            LdapResultCode::OperationsError,
                            &format!("StartTLS Handshake error : \"{e}\""),
                        ),
                        Some(OID_STARTTLS.to_string()),
                    ))
                    .await?;
                format!("Type=StartTLS\nResult=StartTLS Handshake error {e}\n")
            }
        };

        self.recorder.record_unidentified(&transcript, remote).await;
        Ok(Flow::Continue)
    }

    async fn not_found<C>(
        &self,
        client: &mut C,
        msgid: i32,
        op: LdapOp,
        remote: &str,
    ) -> Result<Flow, SessionError>
    where
        C: LdapClient + ?Sized,
    {
        let transcript = format!("Type={}\n", op_name(&op));
        request_warn!(op = op_name(&op), "Unhandled LDAP operation");

        let reply = match op {
            LdapOp::BindRequest(_) => LdapOp::BindResponse(LdapBindResponse {
                res: ldap_result(LdapResultCode::Success, DIAG_DEFAULT_BIND),
                saslcreds: None,
            }),
            LdapOp::ModifyDNRequest(_) => LdapOp::ModifyDNResponse(ldap_result(
                LdapResultCode::UnwillingToPerform,
                DIAG_NOT_IMPLEMENTED,
            )),
            _ => LdapOp::ExtendedResponse(LdapExtendedResponse {
                res: ldap_result(LdapResultCode::UnwillingToPerform, DIAG_NOT_IMPLEMENTED),
                name: None,
                value: None,
            }),
        };

        client
            .write(LdapMsg {
                msgid,
                op: reply,
                ctrl: vec![],
            })
            .await?;

        self.recorder.record_unidentified(&transcript, remote).await;
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use async_trait::async_trait;
    use ldap3_proto::proto::*;

    use super::{filter_to_string, Flow, LdapClient, LdapResponder};
    use crate::constants::{DIAG_DEFAULT_BIND, DIAG_NOT_IMPLEMENTED, OID_STARTTLS, OID_WHOAMI};
    use crate::correlation::CorrelationMatcher;
    use crate::error::{SessionError, TlsError};
    use crate::interaction::Interaction;
    use crate::recorder::InteractionRecorder;
    use crate::storage::MemoryStorage;

    const TOKEN: &str = "c59e3crp82ke7bcnedq0cfjqdpeyyyyyy";
    const SERVER_TOKEN: &str = "server-token";

    struct MockClient {
        sent: Vec<LdapMsg>,
        tls_fails: bool,
        tls_active: bool,
        in_flight: HashSet<i32>,
        abandoned: HashSet<i32>,
    }

    impl MockClient {
        fn new() -> Self {
            MockClient {
                sent: Vec::new(),
                tls_fails: false,
                tls_active: false,
                in_flight: HashSet::new(),
                abandoned: HashSet::new(),
            }
        }
    }

    #[async_trait]
    impl LdapClient for MockClient {
        fn remote_address(&self) -> SocketAddr {
            "192.0.2.10:40000".parse().unwrap()
        }

        async fn write(&mut self, msg: LdapMsg) -> Result<(), SessionError> {
            self.sent.push(msg);
            Ok(())
        }

        async fn start_tls(&mut self) -> Result<(), TlsError> {
            if self.tls_fails {
                Err(TlsError::Provider("simulated handshake failure".to_string()))
            } else {
                self.tls_active = true;
                Ok(())
            }
        }

        fn abandon(&self, msgid: i32) -> bool {
            self.in_flight.contains(&msgid)
        }

        fn is_abandoned(&self, msgid: i32) -> bool {
            self.abandoned.contains(&msgid)
        }
    }

    fn setup() -> (Arc<MemoryStorage>, LdapResponder) {
        let storage = Arc::new(MemoryStorage::new());
        let recorder = Arc::new(InteractionRecorder::new(
            storage.clone(),
            SERVER_TOKEN.to_string(),
        ));
        let matcher = CorrelationMatcher::new("interact.sh").unwrap();
        (storage, LdapResponder::new(recorder, matcher))
    }

    fn records(storage: &MemoryStorage, key: &str) -> Vec<Interaction> {
        storage
            .get(key)
            .iter()
            .map(|d| serde_json::from_slice(d).unwrap())
            .collect()
    }

    fn search_msg(msgid: i32, base: &str) -> LdapMsg {
        LdapMsg {
            msgid,
            op: LdapOp::SearchRequest(LdapSearchRequest {
                base: base.to_string(),
                scope: LdapSearchScope::Subtree,
                aliases: LdapDerefAliases::Never,
                sizelimit: 0,
                timelimit: 30,
                typesonly: false,
                filter: LdapFilter::Present("objectClass".to_string()),
                attrs: vec!["cn".to_string(), "mail".to_string()],
            }),
            ctrl: vec![],
        }
    }

    fn result_of(msg: &LdapMsg) -> &LdapResult {
        match &msg.op {
            LdapOp::BindResponse(r) => &r.res,
            LdapOp::SearchResultDone(r)
            | LdapOp::ModifyResponse(r)
            | LdapOp::AddResponse(r)
            | LdapOp::DelResponse(r)
            | LdapOp::ModifyDNResponse(r)
            | LdapOp::CompareResult(r) => r,
            LdapOp::ExtendedResponse(r) => &r.res,
            op => panic!("not a result: {:?}", op),
        }
    }

    #[tokio::test]
    async fn test_simple_bind() {
        sketching::test_init();
        let (storage, responder) = setup();
        let mut client = MockClient::new();

        let flow = responder
            .handle(
                &mut client,
                LdapMsg {
                    msgid: 1,
                    op: LdapOp::BindRequest(LdapBindRequest {
                        dn: "cn=admin,dc=example,dc=com".to_string(),
                        cred: LdapBindCred::Simple("hunter2".to_string()),
                    }),
                    ctrl: vec![],
                },
            )
            .await
            .unwrap();
        assert_eq!(flow, Flow::Continue);

        assert_eq!(client.sent.len(), 1);
        assert_eq!(client.sent[0].msgid, 1);
        assert_eq!(result_of(&client.sent[0]).code, LdapResultCode::Success);

        let r = records(&storage, SERVER_TOKEN);
        assert_eq!(r.len(), 1);
        assert_eq!(
            r[0].raw_request,
            "Type=Bind\nAuthenticationChoice=simple\nUser=cn=admin,dc=example,dc=com\nPass=hunter2\n"
        );
        assert_eq!(r[0].remote_address, "192.0.2.10:40000");
    }

    #[tokio::test]
    async fn test_search_with_identifier() {
        let (storage, responder) = setup();
        let mut client = MockClient::new();
        let base = format!("{TOKEN}.interact.sh");

        responder
            .handle(&mut client, search_msg(2, &base))
            .await
            .unwrap();

        assert_eq!(client.sent.len(), 2);
        match &client.sent[0].op {
            LdapOp::SearchResultEntry(e) => {
                assert_eq!(e.dn, format!("cn=ldapcatch, {base}"));
                let names: Vec<_> = e.attributes.iter().map(|a| a.atype.as_str()).collect();
                assert_eq!(
                    names,
                    vec![
                        "mail",
                        "company",
                        "department",
                        "l",
                        "mobile",
                        "telephoneNumber",
                        "cn"
                    ]
                );
            }
            op => panic!("expected entry, got {:?}", op),
        }
        assert!(matches!(
            &client.sent[1].op,
            LdapOp::SearchResultDone(r) if r.code == LdapResultCode::Success
        ));
        assert!(client.sent.iter().all(|m| m.msgid == 2));

        let identified = records(&storage, &TOKEN[..20]);
        assert_eq!(identified.len(), 1);
        assert_eq!(identified[0].unique_id, TOKEN);
        assert_eq!(identified[0].full_id, TOKEN);
        assert!(identified[0]
            .raw_request
            .contains(&format!("BaseDn={base}\n")));
        assert!(identified[0]
            .raw_request
            .contains("FilterString=(objectClass=*)\n"));
        assert!(identified[0].raw_request.contains("Attributes=[cn mail]\n"));
        assert!(identified[0].raw_request.contains("TimeLimit=30\n"));

        let general = records(&storage, SERVER_TOKEN);
        assert_eq!(general.len(), 1);
        assert_eq!(general[0].raw_request, identified[0].raw_request);
        assert_eq!(general[0].unique_id, "");
    }

    #[tokio::test]
    async fn test_search_identifier_with_leading_label() {
        let (storage, responder) = setup();
        let mut client = MockClient::new();

        responder
            .handle(&mut client, search_msg(3, &format!("sub.{TOKEN}.interact.sh")))
            .await
            .unwrap();

        let identified = records(&storage, &TOKEN[..20]);
        assert_eq!(identified.len(), 1);
        assert_eq!(identified[0].full_id, format!("sub.{TOKEN}"));
    }

    #[tokio::test]
    async fn test_search_without_identifier() {
        let (storage, responder) = setup();
        let mut client = MockClient::new();

        responder
            .handle(&mut client, search_msg(4, "dc=example,dc=com"))
            .await
            .unwrap();

        assert_eq!(client.sent.len(), 2);
        assert_eq!(storage.keys(), vec![SERVER_TOKEN.to_string()]);
    }

    #[tokio::test]
    async fn test_abandoned_search_skips_entry() {
        let (_storage, responder) = setup();
        let mut client = MockClient::new();
        client.abandoned.insert(5);

        responder
            .handle(&mut client, search_msg(5, "dc=example,dc=com"))
            .await
            .unwrap();

        assert_eq!(client.sent.len(), 1);
        assert!(matches!(&client.sent[0].op, LdapOp::SearchResultDone(_)));
    }

    #[tokio::test]
    async fn test_abandon_sends_nothing() {
        let (storage, responder) = setup();
        let mut client = MockClient::new();
        client.in_flight.insert(7);

        responder
            .handle(
                &mut client,
                LdapMsg {
                    msgid: 8,
                    op: LdapOp::AbandonRequest(7),
                    ctrl: vec![],
                },
            )
            .await
            .unwrap();

        assert!(client.sent.is_empty());
        let r = records(&storage, SERVER_TOKEN);
        assert_eq!(r.len(), 1);
        assert!(r[0].raw_request.starts_with("Type=Abandon\n"));
    }

    #[tokio::test]
    async fn test_compare_is_true() {
        let (storage, responder) = setup();
        let mut client = MockClient::new();

        responder
            .handle(
                &mut client,
                LdapMsg {
                    msgid: 9,
                    op: LdapOp::CompareRequest(LdapCompareRequest {
                        dn: "cn=a".to_string(),
                        atype: "userPassword".to_string(),
                        val: b"secret".to_vec(),
                    }),
                    ctrl: vec![],
                },
            )
            .await
            .unwrap();

        assert_eq!(result_of(&client.sent[0]).code, LdapResultCode::CompareTrue);
        let r = records(&storage, SERVER_TOKEN);
        assert!(r[0]
            .raw_request
            .contains("Attribute name to compare=userPassword\n"));
        assert!(r[0].raw_request.contains("Attribute value expected=secret\n"));
    }

    #[tokio::test]
    async fn test_add_and_delete() {
        let (storage, responder) = setup();
        let mut client = MockClient::new();

        responder
            .handle(
                &mut client,
                LdapMsg {
                    msgid: 10,
                    op: LdapOp::AddRequest(LdapAddRequest {
                        dn: "cn=new,dc=example".to_string(),
                        attributes: vec![LdapAttribute {
                            atype: "objectClass".to_string(),
                            vals: vec![b"top".to_vec(), b"person".to_vec()],
                        }],
                    }),
                    ctrl: vec![],
                },
            )
            .await
            .unwrap();
        responder
            .handle(
                &mut client,
                LdapMsg {
                    msgid: 11,
                    op: LdapOp::DelRequest("cn=old,dc=example".to_string()),
                    ctrl: vec![],
                },
            )
            .await
            .unwrap();

        assert!(matches!(&client.sent[0].op, LdapOp::AddResponse(r) if r.code == LdapResultCode::Success));
        assert!(matches!(&client.sent[1].op, LdapOp::DelResponse(r) if r.code == LdapResultCode::Success));

        let r = records(&storage, SERVER_TOKEN);
        assert_eq!(
            r[0].raw_request,
            "Type=Add\nEntity=cn=new,dc=example\n\
             Attribute Name=objectClass Attribute Value=top\n\
             Attribute Name=objectClass Attribute Value=person\n"
        );
        assert_eq!(r[1].raw_request, "Type=Delete\nEntity=cn=old,dc=example\n");
    }

    #[tokio::test]
    async fn test_modify_preserves_change_order() {
        let (storage, responder) = setup();
        let mut client = MockClient::new();

        let change = |operation, atype: &str, vals: &[&str]| LdapModify {
            operation,
            modification: LdapPartialAttribute {
                atype: atype.to_string(),
                vals: vals.iter().map(|v| v.as_bytes().to_vec()).collect(),
            },
        };

        responder
            .handle(
                &mut client,
                LdapMsg {
                    msgid: 12,
                    op: LdapOp::ModifyRequest(LdapModifyRequest {
                        dn: "cn=target".to_string(),
                        changes: vec![
                            change(LdapModifyType::Add, "mail", &["a@x", "b@x"]),
                            change(LdapModifyType::Delete, "phone", &[]),
                            change(LdapModifyType::Replace, "cn", &["new"]),
                        ],
                    }),
                    ctrl: vec![],
                },
            )
            .await
            .unwrap();

        assert_eq!(result_of(&client.sent[0]).code, LdapResultCode::Success);

        let r = records(&storage, SERVER_TOKEN);
        let ops: Vec<&str> = r[0]
            .raw_request
            .lines()
            .filter(|l| l.starts_with("Operation="))
            .collect();
        assert_eq!(
            ops,
            vec![
                "Operation=Add Attribute=mail Values=[a@x - b@x]",
                "Operation=Delete Attribute=phone Values=[]",
                "Operation=Replace Attribute=cn Values=[new]",
            ]
        );
    }

    fn extended_msg(msgid: i32, name: &str, value: Option<&[u8]>) -> LdapMsg {
        LdapMsg {
            msgid,
            op: LdapOp::ExtendedRequest(LdapExtendedRequest {
                name: name.to_string(),
                value: value.map(|v| v.to_vec()),
            }),
            ctrl: vec![],
        }
    }

    #[tokio::test]
    async fn test_starttls_success() {
        let (storage, responder) = setup();
        let mut client = MockClient::new();

        responder
            .handle(&mut client, extended_msg(13, OID_STARTTLS, None))
            .await
            .unwrap();

        assert!(client.tls_active);
        assert_eq!(client.sent.len(), 1);
        match &client.sent[0].op {
            LdapOp::ExtendedResponse(r) => {
                assert_eq!(r.res.code, LdapResultCode::Success);
                assert_eq!(r.name.as_deref(), Some(OID_STARTTLS));
            }
            op => panic!("unexpected {:?}", op),
        }
        let r = records(&storage, SERVER_TOKEN);
        assert_eq!(r[0].raw_request, "Type=StartTLS\nResult=StartTLS OK\n");
    }

    #[tokio::test]
    async fn test_starttls_handshake_failure() {
        let (storage, responder) = setup();
        let mut client = MockClient::new();
        client.tls_fails = true;

        let flow = responder
            .handle(&mut client, extended_msg(14, OID_STARTTLS, None))
            .await
            .unwrap();
        assert_eq!(flow, Flow::Continue);
        assert!(!client.tls_active);

        assert_eq!(client.sent.len(), 2);
        assert_eq!(result_of(&client.sent[0]).code, LdapResultCode::Success);
        let failure = result_of(&client.sent[1]);
        assert_eq!(failure.code, LdapResultCode::OperationsError);
        assert!(failure.message.contains("simulated handshake failure"));
        assert!(failure.message.starts_with("StartTLS Handshake error"));

        let r = records(&storage, SERVER_TOKEN);
        assert_eq!(r.len(), 1);
        assert!(r[0]
            .raw_request
            .contains("Result=StartTLS Handshake error certificate provider: simulated handshake failure"));
    }

    #[tokio::test]
    async fn test_whoami_and_generic_extended() {
        let (storage, responder) = setup();
        let mut client = MockClient::new();

        responder
            .handle(&mut client, extended_msg(15, OID_WHOAMI, None))
            .await
            .unwrap();
        responder
            .handle(&mut client, extended_msg(16, "1.2.3.4", Some(b"payload")))
            .await
            .unwrap();

        for msg in &client.sent {
            match &msg.op {
                LdapOp::ExtendedResponse(r) => {
                    assert_eq!(r.res.code, LdapResultCode::Success);
                    assert!(r.value.is_none());
                }
                op => panic!("unexpected {:?}", op),
            }
        }

        let r = records(&storage, SERVER_TOKEN);
        assert_eq!(r[0].raw_request, "Type=WhoAmI\n");
        assert_eq!(r[1].raw_request, "Type=Extended\nName=1.2.3.4\nValue=payload\n");
    }

    #[tokio::test]
    async fn test_unrecognized_operations() {
        let (storage, responder) = setup();
        let mut client = MockClient::new();

        responder
            .handle(
                &mut client,
                LdapMsg {
                    msgid: 17,
                    op: LdapOp::ModifyDNRequest(LdapModifyDNRequest {
                        dn: "cn=a".to_string(),
                        newrdn: "cn=b".to_string(),
                        deleteoldrdn: true,
                        new_superior: None,
                    }),
                    ctrl: vec![],
                },
            )
            .await
            .unwrap();

        let res = result_of(&client.sent[0]);
        assert_eq!(res.code, LdapResultCode::UnwillingToPerform);
        assert_eq!(res.message, DIAG_NOT_IMPLEMENTED);

        responder
            .handle(
                &mut client,
                LdapMsg {
                    msgid: 18,
                    op: LdapOp::BindRequest(LdapBindRequest {
                        dn: String::new(),
                        cred: LdapBindCred::SASL(SaslCredentials {
                            mechanism: "EXTERNAL".to_string(),
                            credentials: vec![],
                        }),
                    }),
                    ctrl: vec![],
                },
            )
            .await
            .unwrap();

        let res = result_of(&client.sent[1]);
        assert_eq!(res.code, LdapResultCode::Success);
        assert_eq!(res.message, DIAG_DEFAULT_BIND);

        let r = records(&storage, SERVER_TOKEN);
        assert_eq!(r[0].raw_request, "Type=ModifyDN\n");
        assert_eq!(r[1].raw_request, "Type=Bind\n");
    }

    #[tokio::test]
    async fn test_unbind_closes_without_record() {
        let (storage, responder) = setup();
        let mut client = MockClient::new();

        let flow = responder
            .handle(
                &mut client,
                LdapMsg {
                    msgid: 19,
                    op: LdapOp::UnbindRequest,
                    ctrl: vec![],
                },
            )
            .await
            .unwrap();

        assert_eq!(flow, Flow::Close);
        assert!(client.sent.is_empty());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_filter_to_string() {
        let f = LdapFilter::And(vec![
            LdapFilter::Equality("uid".to_string(), "a(b)*".to_string()),
            LdapFilter::Not(Box::new(LdapFilter::Present("mail".to_string()))),
            LdapFilter::Or(vec![LdapFilter::Substring(
                "cn".to_string(),
                LdapSubstringFilter {
                    initial: Some("ad".to_string()),
                    any: vec!["mi".to_string()],
                    final_: Some("n".to_string()),
                },
            )]),
        ]);
        assert_eq!(
            filter_to_string(&f),
            "(&(uid=a\\28b\\29\\2a)(!(mail=*))(|(cn=ad*mi*n)))"
        );
    }
}
