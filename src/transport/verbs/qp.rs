//! Reliable-connected queue pairs: INIT at creation, RTR/RTS on connect.

use super::{DeviceCtx, access_flags};
use crate::error::{CommError, Result};
use crate::transport::driver::{IbQueuePair, QpEndpoint, RdmaWrite, WorkCompletion};
use ibverbs_sys::{ibv_qp_attr_mask, ibv_qp_state, ibv_send_flags, ibv_wr_opcode};
use std::os::raw::c_int;
use std::ptr;
use std::sync::Arc;

pub(super) struct VerbsQp {
    qp: *mut ibverbs_sys::ibv_qp,
    cq: *mut ibverbs_sys::ibv_cq,
    capacity: usize,
    port: u8,
    gid_index: u8,
    local: QpEndpoint,
    device: Arc<DeviceCtx>,
}

// Only ever used behind the connection's mutex.
unsafe impl Send for VerbsQp {}

impl VerbsQp {
    pub(super) fn create(
        device: Arc<DeviceCtx>,
        port: u8,
        gid_index: u8,
        depth: usize,
    ) -> Result<Self> {
        let depth_c = c_int::try_from(depth).unwrap_or(c_int::MAX);
        // SAFETY: device.ctx is open for as long as `device` lives.
        let cq = unsafe {
            ibverbs_sys::ibv_create_cq(device.ctx, depth_c, ptr::null_mut(), ptr::null_mut(), 0)
        };
        if cq.is_null() {
            return Err(CommError::transport("RDMA: ibv_create_cq failed"));
        }

        // From here on Drop releases whatever has been created.
        let mut this = Self {
            qp: ptr::null_mut(),
            cq,
            capacity: depth,
            port,
            gid_index,
            local: QpEndpoint {
                qp_num: 0,
                lid: 0,
                gid: [0; 16],
            },
            device,
        };

        // SAFETY: zeroed attribute structs are valid inputs for verbs; the
        // pd and cq are live.
        unsafe {
            let mut init: ibverbs_sys::ibv_qp_init_attr = std::mem::zeroed();
            init.qp_type = ibverbs_sys::ibv_qp_type::IBV_QPT_RC;
            init.send_cq = cq;
            init.recv_cq = cq;
            init.cap.max_send_wr = depth as u32;
            init.cap.max_recv_wr = 1;
            init.cap.max_send_sge = 1;
            init.cap.max_recv_sge = 1;
            this.qp = ibverbs_sys::ibv_create_qp(this.device.pd, &mut init);
            if this.qp.is_null() {
                return Err(CommError::transport("RDMA: ibv_create_qp failed"));
            }

            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
            attr.pkey_index = 0;
            attr.port_num = port;
            attr.qp_access_flags = access_flags().0;
            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                | ibv_qp_attr_mask::IBV_QP_PORT
                | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
            let rc = ibverbs_sys::ibv_modify_qp(this.qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                return Err(CommError::transport(format!(
                    "RDMA: ibv_modify_qp to INIT failed (rc={rc})"
                )));
            }

            let mut gid: ibverbs_sys::ibv_gid = std::mem::zeroed();
            let rc = ibverbs_sys::ibv_query_gid(this.device.ctx, port, gid_index as c_int, &mut gid);
            if rc != 0 {
                return Err(CommError::transport(format!(
                    "RDMA: ibv_query_gid(port={port}, index={gid_index}) failed (rc={rc})"
                )));
            }

            // GID routing works for both IB and RoCE; LID stays 0.
            this.local = QpEndpoint {
                qp_num: (*this.qp).qp_num,
                lid: 0,
                gid: gid.raw,
            };
        }
        Ok(this)
    }
}

impl IbQueuePair for VerbsQp {
    fn endpoint(&self) -> QpEndpoint {
        self.local
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn connect(&mut self, remote: &QpEndpoint) -> Result<()> {
        // SAFETY: qp is live and in INIT; attribute structs start zeroed.
        unsafe {
            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
            attr.path_mtu = ibverbs_sys::IBV_MTU_4096;
            attr.dest_qp_num = remote.qp_num;
            attr.rq_psn = 0;
            attr.max_dest_rd_atomic = 4;
            attr.min_rnr_timer = 12;
            attr.ah_attr.is_global = 1;
            attr.ah_attr.grh.dgid.raw = remote.gid;
            attr.ah_attr.grh.sgid_index = self.gid_index;
            attr.ah_attr.grh.hop_limit = 64;
            attr.ah_attr.dlid = remote.lid;
            attr.ah_attr.port_num = self.port;
            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_AV
                | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                | ibv_qp_attr_mask::IBV_QP_RQ_PSN
                | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
            let rc = ibverbs_sys::ibv_modify_qp(self.qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                return Err(CommError::transport(format!(
                    "RDMA: ibv_modify_qp to RTR failed (rc={rc})"
                )));
            }

            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
            attr.sq_psn = 0;
            attr.timeout = 14;
            attr.retry_cnt = 7;
            attr.rnr_retry = 7;
            attr.max_rd_atomic = 4;
            let mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                | ibv_qp_attr_mask::IBV_QP_SQ_PSN
                | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
            let rc = ibverbs_sys::ibv_modify_qp(self.qp, &mut attr, mask.0 as c_int);
            if rc != 0 {
                return Err(CommError::transport(format!(
                    "RDMA: ibv_modify_qp to RTS failed (rc={rc})"
                )));
            }
        }
        tracing::debug!(
            local_qpn = self.local.qp_num,
            remote_qpn = remote.qp_num,
            "queue pair ready to send"
        );
        Ok(())
    }

    unsafe fn post_write(&mut self, wr: &RdmaWrite) -> Result<()> {
        // SAFETY: qp is live; sge and send_wr outlive the post call, and the
        // caller keeps the local range valid until completion.
        unsafe {
            let mut sge: ibverbs_sys::ibv_sge = std::mem::zeroed();
            sge.addr = wr.local_addr;
            sge.length = wr.len;
            sge.lkey = wr.lkey;

            let mut send: ibverbs_sys::ibv_send_wr = std::mem::zeroed();
            send.wr_id = wr.wr_id;
            send.sg_list = &mut sge;
            send.num_sge = 1;
            send.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
            send.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
            send.wr.rdma.remote_addr = wr.remote_addr;
            send.wr.rdma.rkey = wr.rkey;

            let mut bad: *mut ibverbs_sys::ibv_send_wr = ptr::null_mut();
            let ctx = (*self.qp).context;
            let post_send = (*ctx)
                .ops
                .post_send
                .ok_or_else(|| CommError::transport("RDMA: provider has no post_send"))?;
            let rc = post_send(self.qp, &mut send, &mut bad);
            if rc != 0 {
                return Err(CommError::transport(format!(
                    "RDMA: post_send failed (rc={rc})"
                )));
            }
        }
        Ok(())
    }

    fn poll(&mut self, out: &mut Vec<WorkCompletion>) -> Result<()> {
        // SAFETY: cq is live; wc is a plain output struct.
        unsafe {
            let ctx = (*self.cq).context;
            let poll_cq = (*ctx)
                .ops
                .poll_cq
                .ok_or_else(|| CommError::transport("RDMA: provider has no poll_cq"))?;
            loop {
                let mut wc = ibverbs_sys::ibv_wc::default();
                let n = poll_cq(self.cq, 1, &mut wc);
                if n < 0 {
                    return Err(CommError::transport("RDMA: poll_cq failed"));
                }
                if n == 0 {
                    return Ok(());
                }
                let error = wc.error().map(|(status, vendor_err)| {
                    format!("status={status:?}, vendor_err={vendor_err}")
                });
                out.push(WorkCompletion {
                    wr_id: wc.wr_id(),
                    error,
                });
            }
        }
    }
}

impl Drop for VerbsQp {
    fn drop(&mut self) {
        // SAFETY: each handle is destroyed once, queue pair before its CQ.
        unsafe {
            if !self.qp.is_null() {
                ibverbs_sys::ibv_destroy_qp(self.qp);
            }
            if !self.cq.is_null() {
                ibverbs_sys::ibv_destroy_cq(self.cq);
            }
        }
    }
}
